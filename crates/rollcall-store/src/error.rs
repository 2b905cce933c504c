use rollcall_core::{DenyReason, IdentityId, LifecycleState, TransitionError};
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock was poisoned by a panic on another thread.
    #[error("store lock poisoned")]
    Poisoned,

    /// Embedding dimension does not match the configured dimension.
    #[error("invalid template: expected {expected}-dim embedding, got {actual}")]
    InvalidTemplate { expected: usize, actual: usize },

    #[error("invalid template: embedding contains non-finite values")]
    NonFiniteTemplate,

    #[error("template crypto error: {0}")]
    Crypto(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(IdentityId),

    #[error("identity already registered: {0}")]
    DuplicateIdentity(IdentityId),

    #[error("identity {identity} is {state:?}")]
    InvalidState {
        identity: IdentityId,
        state: LifecycleState,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The consent guard refused the write when re-checked inside the
    /// transaction.
    #[error("denied: {}", .0.code())]
    Denied(DenyReason),

    /// Audit hash chain verification failed.
    #[error("audit chain broken at seq={seq}")]
    ChainBroken { seq: i64 },
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StoreError::Poisoned
    }
}
