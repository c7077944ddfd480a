//! Error taxonomy of the executor broker.

use crate::ids::ThreadId;

/// Errors reported by registry, id map and handshake operations.
///
/// None of these are fatal to the process. The worst outcome is a stale
/// entry for a dead thread that the next watcher cycle reclaims.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Entry already present")]
    AlreadyPresent,

    #[error("Entry not found")]
    NotFound,

    #[error("{0} is gone or cannot be watched")]
    InvalidThread(ThreadId),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Executor creation failed: {0}")]
    CreationFailed(String),

    #[error("Timed out waiting for executor registration")]
    Timeout,

    #[error("Watcher fault: {0}")]
    WatcherFault(String),
}

impl BrokerError {
    /// Benign outcomes a caller can usually ignore.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyPresent | Self::NotFound)
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Timeout | Self::CreationFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
