//! Error kinds shared across the Manager core.
//!
//! Every failure a subsystem can hand back to the router or the admin
//! surface is one of these kinds. The p2p protocol serializes the kind
//! string verbatim; HTTP ingest reports failures as a flat 500 carrying
//! the error text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// State-machine violation — the operation is legal, the state isn't.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Identity mismatch — the caller is not who the payload claims.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("deadline passed: {0}")]
    DeadlinePassed(String),

    /// Replayed onboarding nonce.
    #[error("replay: {0}")]
    Replay(String),

    #[error("proof invalid: {0}")]
    ProofInvalid(String),

    #[error("batch exceeds configured maximum: {0}")]
    BatchTooLarge(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The manager is stopping; in-flight handlers receive this.
    #[error("cancelled")]
    Cancelled,
}

/// Wire-stable kind tags. These strings ARE the protocol's error
/// vocabulary — do not rename after release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Forbidden,
    DeadlinePassed,
    Replay,
    ProofInvalid,
    BatchTooLarge,
    StoreError,
    TransportError,
    Cancelled,
}

impl ManagerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ManagerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ManagerError::NotFound(_) => ErrorKind::NotFound,
            ManagerError::Conflict(_) => ErrorKind::Conflict,
            ManagerError::Forbidden(_) => ErrorKind::Forbidden,
            ManagerError::DeadlinePassed(_) => ErrorKind::DeadlinePassed,
            ManagerError::Replay(_) => ErrorKind::Replay,
            ManagerError::ProofInvalid(_) => ErrorKind::ProofInvalid,
            ManagerError::BatchTooLarge(_) => ErrorKind::BatchTooLarge,
            ManagerError::Store(_) => ErrorKind::StoreError,
            ManagerError::Transport(_) => ErrorKind::TransportError,
            ManagerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}
