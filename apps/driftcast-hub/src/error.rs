use crate::store::StoreError;

/// Typed errors surfaced to callers of the coordinator's operations.
/// Invariant violations are never retried automatically; store errors are
/// transient and re-thrown after any compensating cleanup has run.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("user is already in another stream")]
    AlreadyInStream,
    #[error("stream not found")]
    StreamNotFound,
    #[error("stream has ended")]
    StreamEnded,
    #[error("not authorized")]
    NotAuthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("coordinator unavailable")]
    CoordinatorClosed,
}
