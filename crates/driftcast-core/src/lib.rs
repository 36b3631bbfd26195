//! Shared primitives for the driftcast live session control plane.
//!
//! Everything here is plain data plus the pure auto-termination policy.
//! The hub service owns all I/O and state transitions.

pub mod session;

pub use session::{
    normalize_title, ActiveStreamPointer, EndReason, Participant, StreamSession, DEFAULT_TITLE,
};
