use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftcast_core::{ActiveStreamPointer, EndReason, StreamSession};
use tokio::sync::{broadcast, Mutex};

use super::{StoreError, StreamStore};

const SNAPSHOT_CHANNEL_DEPTH: usize = 64;

/// In-memory adapter for tests and early wiring. Mutations publish the new
/// active result set, so subscription behavior matches the real backends.
pub struct MemoryStreamStore {
    inner: Mutex<Inner>,
    snapshots: broadcast::Sender<Vec<StreamSession>>,
    privileged_endpoint: bool,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, StreamSession>,
    pointers: HashMap<String, ActiveStreamPointer>,
}

impl MemoryStreamStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    /// Variant with the privileged termination endpoint disabled, forcing
    /// callers onto the client-side fallback path.
    pub fn without_privileged_endpoint() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    fn build(privileged_endpoint: bool) -> Self {
        let (snapshots, _) = broadcast::channel(SNAPSHOT_CHANNEL_DEPTH);
        Self {
            inner: Mutex::new(Inner::default()),
            snapshots,
            privileged_endpoint,
        }
    }

    /// Direct document write with no snapshot publication, for staging
    /// out-of-band remote state in tests.
    pub async fn seed_session(&self, session: StreamSession) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id.clone(), session);
    }

    /// Out-of-band document removal, as another client instance would do.
    pub async fn remove_out_of_band(&self, stream_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(stream_id);
        self.publish(&inner);
    }

    pub async fn pointer_count(&self) -> usize {
        self.inner.lock().await.pointers.len()
    }

    fn publish(&self, inner: &Inner) {
        let active: Vec<StreamSession> = inner
            .sessions
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        let _ = self.snapshots.send(active);
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn get_session(&self, stream_id: &str) -> Result<Option<StreamSession>, StoreError> {
        Ok(self.inner.lock().await.sessions.get(stream_id).cloned())
    }

    async fn put_session(&self, session: &StreamSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.id.clone(), session.clone());
        self.publish(&inner);
        Ok(())
    }

    async fn patch_participants(&self, session: &StreamSession) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.sessions.get_mut(&session.id) {
            stored.participants = session.participants.clone();
            stored.viewer_count = session.viewer_count;
            stored.banned_user_ids = session.banned_user_ids.clone();
            stored.last_activity_at = session.last_activity_at;
            self.publish(&inner);
        }
        Ok(())
    }

    async fn mark_ended(&self, stream_id: &str, reason: EndReason) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.sessions.get_mut(stream_id) {
            if stored.is_active {
                stored.mark_ended(reason);
                self.publish(&inner);
            }
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<StreamSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect())
    }

    async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StreamSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sessions
            .values()
            .filter(|s| s.is_active && s.last_activity_at < cutoff)
            .cloned()
            .collect())
    }

    async fn delete_session(&self, stream_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.sessions.remove(stream_id).is_some() {
            self.publish(&inner);
        }
        Ok(())
    }

    async fn get_pointer(&self, user_id: &str) -> Result<Option<ActiveStreamPointer>, StoreError> {
        Ok(self.inner.lock().await.pointers.get(user_id).cloned())
    }

    async fn set_pointer(&self, user_id: &str, stream_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.pointers.insert(
            user_id.to_string(),
            ActiveStreamPointer::new(user_id, stream_id),
        );
        Ok(())
    }

    async fn clear_pointer(&self, user_id: &str) -> Result<(), StoreError> {
        self.inner.lock().await.pointers.remove(user_id);
        Ok(())
    }

    async fn end_stream_and_cleanup(
        &self,
        stream_id: &str,
        reason: EndReason,
    ) -> Result<bool, StoreError> {
        if !self.privileged_endpoint {
            return Ok(false);
        }
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.sessions.get_mut(stream_id) {
            if stored.is_active {
                stored.mark_ended(reason);
            }
        }
        inner
            .pointers
            .retain(|_, pointer| pointer.stream_id != stream_id);
        self.publish(&inner);
        Ok(true)
    }

    async fn subscribe_active(
        &self,
    ) -> Result<broadcast::Receiver<Vec<StreamSession>>, StoreError> {
        Ok(self.snapshots.subscribe())
    }
}
