//! Active-participation tracker.
//!
//! Owns the per-user active-stream pointer: the mutual-exclusion marker
//! enforcing "one active stream per user". The pointer is authoritative
//! even when it disagrees with a session's participant list; disagreement
//! is exactly the ghost condition this component exists to reconcile.

use tracing::{debug, info, warn};

use crate::store::{SharedStore, StoreError};

/// Which half-finished operation a compensating rollback is cleaning after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialOp {
    Create,
    Join,
}

/// What ghost-state recovery did, reported for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Pointer was absent or consistent; nothing to do.
    None,
    /// Pointer referenced a session that no longer exists.
    ClearedMissingSession,
    /// Pointer referenced a session that is no longer active.
    ClearedEndedSession,
    /// Pointer referenced a live session the user is not listed in.
    ClearedNotParticipant,
}

#[derive(Debug, Clone, Copy)]
pub struct GhostRecovery {
    pub recovered: bool,
    pub action: RecoveryAction,
}

#[derive(Clone)]
pub struct ParticipationTracker {
    store: SharedStore,
}

impl ParticipationTracker {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// The stream the user's pointer currently references, if any.
    pub async fn active_stream(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .store
            .get_pointer(user_id)
            .await?
            .map(|pointer| pointer.stream_id))
    }

    /// True iff the pointer exists and references a stream other than
    /// `candidate_stream_id`.
    pub async fn is_user_in_another_stream(
        &self,
        user_id: &str,
        candidate_stream_id: &str,
    ) -> Result<bool, StoreError> {
        match self.active_stream(user_id).await? {
            Some(stream_id) => Ok(stream_id != candidate_stream_id),
            None => Ok(false),
        }
    }

    pub async fn set_active_stream(
        &self,
        user_id: &str,
        stream_id: &str,
    ) -> Result<(), StoreError> {
        self.store.set_pointer(user_id, stream_id).await
    }

    pub async fn clear_active_stream(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.clear_pointer(user_id).await
    }

    /// Clear a pointer whose referenced session no longer exists or is
    /// inactive. Returns true when a stale pointer was removed.
    pub async fn cleanup_orphaned_stream(&self, user_id: &str) -> Result<bool, StoreError> {
        let Some(stream_id) = self.active_stream(user_id).await? else {
            return Ok(false);
        };
        let orphaned = match self.store.get_session(&stream_id).await? {
            Some(session) => !session.is_active,
            None => true,
        };
        if orphaned {
            self.store.clear_pointer(user_id).await?;
            info!(user = %user_id, stream = %stream_id, "cleared orphaned active-stream pointer");
        }
        Ok(orphaned)
    }

    /// Detect and clear a pointer referencing a session the user is not
    /// actually part of, or that is gone entirely.
    pub async fn recover_ghost_state(&self, user_id: &str) -> Result<GhostRecovery, StoreError> {
        let Some(stream_id) = self.active_stream(user_id).await? else {
            return Ok(GhostRecovery {
                recovered: false,
                action: RecoveryAction::None,
            });
        };

        let action = match self.store.get_session(&stream_id).await? {
            None => Some(RecoveryAction::ClearedMissingSession),
            Some(session) if !session.is_active => Some(RecoveryAction::ClearedEndedSession),
            Some(session) if !session.has_participant(user_id) => {
                Some(RecoveryAction::ClearedNotParticipant)
            }
            Some(_) => None,
        };

        match action {
            Some(action) => {
                self.store.clear_pointer(user_id).await?;
                info!(user = %user_id, stream = %stream_id, ?action, "recovered ghost state");
                Ok(GhostRecovery {
                    recovered: true,
                    action,
                })
            }
            None => Ok(GhostRecovery {
                recovered: false,
                action: RecoveryAction::None,
            }),
        }
    }

    /// Compensating rollback after a failed create or join: remove any
    /// pointer and partial session artifacts attributable to the failed
    /// operation. Best-effort; failures here are logged, never re-thrown,
    /// so the original error reaches the caller.
    pub async fn cleanup_partial_failure(&self, user_id: &str, stream_id: &str, op: PartialOp) {
        debug!(user = %user_id, stream = %stream_id, ?op, "running compensating cleanup");

        if let Err(err) = self.store.clear_pointer(user_id).await {
            warn!(user = %user_id, error = %err, "compensating pointer cleanup failed");
        }

        let session = match self.store.get_session(stream_id).await {
            Ok(session) => session,
            Err(err) => {
                warn!(stream = %stream_id, error = %err, "compensating session lookup failed");
                return;
            }
        };
        let Some(mut session) = session else {
            return;
        };

        match op {
            PartialOp::Create => {
                // Only delete a fragment this create wrote: the caller must
                // still be the recorded host of the half-written session.
                if session.host_user_id == user_id {
                    if let Err(err) = self.store.delete_session(stream_id).await {
                        warn!(stream = %stream_id, error = %err, "compensating session delete failed");
                    } else {
                        info!(stream = %stream_id, "rolled back partially-created session");
                    }
                }
            }
            PartialOp::Join => {
                if session.remove_participant(user_id).is_some() {
                    if let Err(err) = self.store.patch_participants(&session).await {
                        warn!(stream = %stream_id, error = %err, "compensating participant removal failed");
                    } else {
                        info!(user = %user_id, stream = %stream_id, "rolled back partially-joined participant");
                    }
                }
            }
        }
    }

    /// True when any pointer state remains for the user, regardless of
    /// which stream it references.
    pub async fn has_pointer(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.active_stream(user_id).await?.is_some())
    }
}
