//! Keeper error taxonomy.

use keeper_chain::BroadcastError;
use thiserror::Error;

/// How a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or node hiccup; the next cycle tries again
    TransientIo,
    /// Sequence still wrong after the signer's resync and retry
    SequenceMismatch,
    /// No usable price
    StalePrice,
    /// Chain refused or failed the transaction; never resubmitted automatically
    Rejected,
    /// Misconfiguration or missing key material; the process refuses to start
    Fatal,
}

#[derive(Debug, Clone, Error)]
pub enum KeeperError {
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error("no fresh price for {0}")]
    StalePrice(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl KeeperError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Broadcast(e) => match e {
                BroadcastError::Transport(_) | BroadcastError::NotIncluded(_) => {
                    ErrorKind::TransientIo
                }
                BroadcastError::SequenceMismatch { .. } => ErrorKind::SequenceMismatch,
                BroadcastError::Rejected { .. } | BroadcastError::ExecutionFailed { .. } => {
                    ErrorKind::Rejected
                }
                BroadcastError::Encode(_) => ErrorKind::Fatal,
            },
            Self::StalePrice(_) => ErrorKind::StalePrice,
            Self::Config(_) => ErrorKind::Fatal,
        }
    }
}
