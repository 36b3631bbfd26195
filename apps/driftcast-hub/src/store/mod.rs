//! Remote document store seam.
//!
//! The authoritative copy of every session and active-stream pointer lives
//! in a store shared by many hub instances. The trait expresses the
//! operations the coordinator, tracker, and sweeper actually need:
//! per-document reads and patches, a filtered active-session query, an
//! activity-indexed staleness query, a push-based subscription delivering
//! the full current active set, and one privileged operation that ends a
//! session and clears every remaining participant's pointer atomically.

mod memory;
mod redis;

pub use memory::MemoryStreamStore;
pub use redis::RedisStreamStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use driftcast_core::{ActiveStreamPointer, EndReason, StreamSession};
use tokio::sync::broadcast;

pub type SharedStore = Arc<dyn StreamStore>;

/// Message fragments that identify the remote backend's internal-assertion
/// failure class. Matched case-insensitively against backend error text.
const INTERNAL_ASSERTION_SIGNATURES: &[&str] = &["internal assertion", "unexpected state"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("document serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("indexed query unsupported by this backend")]
    QueryUnsupported,
}

impl StoreError {
    /// True for the recognized class of backend-internal failures that must
    /// escalate to the sweeper's circuit breaker instead of being retried.
    pub fn is_internal_assertion(&self) -> bool {
        match self {
            StoreError::Backend(message) => {
                let lowered = message.to_ascii_lowercase();
                INTERNAL_ASSERTION_SIGNATURES
                    .iter()
                    .any(|signature| lowered.contains(signature))
            }
            _ => false,
        }
    }
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn get_session(&self, stream_id: &str) -> Result<Option<StreamSession>, StoreError>;

    /// Persist a full session document, replacing any existing copy.
    async fn put_session(&self, session: &StreamSession) -> Result<(), StoreError>;

    /// Patch the membership fields of an existing session document:
    /// participants, viewer count, ban list, and last-activity timestamp.
    /// A missing document is not an error; the caller treats the session
    /// as already gone.
    async fn patch_participants(&self, session: &StreamSession) -> Result<(), StoreError>;

    /// Client-side termination patch: flips `is_active`, stamps `ended_at`
    /// and `end_reason`. Idempotent; a missing document is not an error.
    async fn mark_ended(&self, stream_id: &str, reason: EndReason) -> Result<(), StoreError>;

    /// Snapshot of every session currently flagged active.
    async fn list_active(&self) -> Result<Vec<StreamSession>, StoreError>;

    /// Active sessions whose last activity is older than `cutoff`, served
    /// by a backend index. Backends without the index report
    /// [`StoreError::QueryUnsupported`] and the caller falls back to
    /// filtering [`Self::list_active`] in-process.
    async fn list_stale_active(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StreamSession>, StoreError>;

    /// Remove a session document entirely. Used only for compensating
    /// rollback of a failed create; terminated sessions are retained,
    /// marked inactive, for audit.
    async fn delete_session(&self, stream_id: &str) -> Result<(), StoreError>;

    async fn get_pointer(&self, user_id: &str) -> Result<Option<ActiveStreamPointer>, StoreError>;

    /// Unconditional pointer write.
    async fn set_pointer(&self, user_id: &str, stream_id: &str) -> Result<(), StoreError>;

    /// Unconditional pointer removal.
    async fn clear_pointer(&self, user_id: &str) -> Result<(), StoreError>;

    /// Privileged server-side termination: atomically mark the session
    /// ended and clear every remaining participant's pointer. Returns
    /// `Ok(false)` when the operation is unavailable on this backend, in
    /// which case the caller must use the client-side fallback path.
    async fn end_stream_and_cleanup(
        &self,
        stream_id: &str,
        reason: EndReason,
    ) -> Result<bool, StoreError>;

    /// Push-based subscription to the active-session query. Every delivery
    /// is the full current result set.
    async fn subscribe_active(
        &self,
    ) -> Result<broadcast::Receiver<Vec<StreamSession>>, StoreError>;
}
