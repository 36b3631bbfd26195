//! Real-time media channel seam.
//!
//! The audio transport itself is an external collaborator. The hub only
//! tells it when to join or leave a channel and listens to its presence and
//! volume events, which are advisory to the coordinator's own state, never
//! authoritative over it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

pub type SharedMedia = Arc<dyn MediaChannel>;

const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub enum MediaEvent {
    ParticipantJoined { user_id: String },
    ParticipantLeft { user_id: String },
    /// Speaking users with their reported volume levels.
    VolumeIndication { speakers: Vec<(String, u32)> },
    ConnectionStateChanged { state: String },
    Error { message: String },
    Warning { message: String },
}

#[async_trait]
pub trait MediaChannel: Send + Sync {
    /// Join a channel for the given stream. Returns false when the join
    /// failed; callers treat that as a degraded capability, not an error.
    async fn join_channel(&self, stream_id: &str, user_id: &str, is_host: bool) -> bool;

    async fn leave_channel(&self);

    async fn mute_local_audio(&self, muted: bool);

    async fn enable_local_video(&self, enabled: bool);

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent>;
}

/// Store-only mode: every join succeeds without any transport attached.
pub struct NullMediaChannel {
    events: broadcast::Sender<MediaEvent>,
}

impl NullMediaChannel {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        Arc::new(Self { events })
    }

    /// Inject an advisory event, as the real transport's callback would.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MediaChannel for NullMediaChannel {
    async fn join_channel(&self, stream_id: &str, user_id: &str, is_host: bool) -> bool {
        debug!(stream = %stream_id, user = %user_id, is_host, "media join (store-only mode)");
        true
    }

    async fn leave_channel(&self) {
        debug!("media leave (store-only mode)");
    }

    async fn mute_local_audio(&self, muted: bool) {
        debug!(muted, "media mute (store-only mode)");
    }

    async fn enable_local_video(&self, enabled: bool) {
        debug!(enabled, "media video toggle (store-only mode)");
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}
