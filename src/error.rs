use thiserror::Error;

use crate::store::{BlobError, StoreError};

/// Broad failure classes the scheduler distinguishes when deciding how to
/// react: reject, retry, requeue, suspend or log-and-continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a missing dependency; rejected synchronously.
    Validation,
    /// A collaborator hiccup worth retrying with backoff.
    Transient,
    /// No work for this client right now; non-fatal status.
    Eligibility,
    /// A client disappeared; its work is requeued automatically.
    Liveness,
    /// A workunit execution failed; retried via skip-lists up to a cap.
    Execution,
    /// Unretryable failure signalled by the workload itself.
    Permanent,
    /// Invariant violation; the offending job is quarantined.
    Fatal,
}

#[derive(Error, Debug)]
pub enum HiveError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("workunit already queued: {0}")]
    AlreadyQueued(String),

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("client suspended: {0}")]
    ClientSuspended(String),

    #[error("client deleted: {0}")]
    ClientDeleted(String),

    #[error("client not active: {0}")]
    ClientNotActive(String),

    #[error("client not suspended: {0}")]
    ClientNotSuspended(String),

    #[error("clientgroup name does not match the authenticated group")]
    ClientGroupBadName,

    #[error("work queue is suspended")]
    QueueSuspend,

    #[error("no eligible workunit found")]
    NoEligibleWorkunitFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("workunit failed: {0}")]
    WorkFailed(String),

    #[error("workunit failed permanently: {0}")]
    PermanentFailure(String),

    #[error("client lost: {0}")]
    ClientLost(String),

    #[error("document store error: {0}")]
    Store(#[from] StoreError),

    #[error("blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HiveError::Validation(_)
            | HiveError::NotFound(_)
            | HiveError::AlreadyQueued(_)
            | HiveError::ClientNotFound(_)
            | HiveError::ClientSuspended(_)
            | HiveError::ClientDeleted(_)
            | HiveError::ClientNotActive(_)
            | HiveError::ClientNotSuspended(_)
            | HiveError::ClientGroupBadName
            | HiveError::Unauthorized => ErrorKind::Validation,
            HiveError::QueueSuspend | HiveError::NoEligibleWorkunitFound => ErrorKind::Eligibility,
            HiveError::WorkFailed(_) => ErrorKind::Execution,
            HiveError::PermanentFailure(_) => ErrorKind::Permanent,
            HiveError::ClientLost(_) => ErrorKind::Liveness,
            HiveError::Store(_) | HiveError::Blob(_) => ErrorKind::Transient,
            HiveError::Internal(_) => ErrorKind::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
