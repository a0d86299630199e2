use std::time::Duration;

use alloy_primitives::Address;
use thiserror::Error;

use crate::types::FailureKind;

/// Errors returned by a [`LedgerApi`](crate::LedgerApi) call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The ledger answered and refused the request.
    #[error("rejected by ledger: {0}")]
    Rejected(String),
    /// The request never got an answer from the ledger.
    #[error("transport error: {0}")]
    Transport(String),
    /// The call did not complete in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be encoded or signed.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// No credential is held for the sender.
    #[error("no signer available for sender {0}")]
    UnknownSender(Address),
}

impl LedgerError {
    /// Classifies the error for submission accounting.
    pub const fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Rejected(_) => FailureKind::Rejected,
            Self::Transport(_) => FailureKind::Transport,
            Self::Timeout(_) => FailureKind::TimedOut,
            Self::Malformed(_) | Self::UnknownSender(_) => FailureKind::Malformed,
        }
    }
}

/// Failures that abort a run before any load is generated.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The ledger could not be reached at all.
    #[error("ledger unreachable: {0}")]
    Unreachable(#[source] LedgerError),
    /// The starting sequence number of a sender could not be read.
    #[error("failed to read starting sequence number of {account}: {source}")]
    SequenceSeed {
        /// The sender whose sequence number was requested.
        account: Address,
        /// The underlying ledger error.
        #[source]
        source: LedgerError,
    },
    /// A balance required for invariant checks could not be read.
    #[error("failed to snapshot balance of {account}: {source}")]
    BalanceSnapshot {
        /// The account whose balance was requested.
        account: Address,
        /// The underlying ledger error.
        #[source]
        source: LedgerError,
    },
    /// The run configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors raised while writing a run report to a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The underlying writer failed.
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),
    /// The report could not be encoded.
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors returned by [`BenchmarkRunner::run_into`](crate::BenchmarkRunner::run_into).
#[derive(Debug, Error)]
pub enum RunError {
    /// The run never started.
    #[error(transparent)]
    Setup(#[from] SetupError),
    /// The run finished but its report could not be delivered.
    #[error(transparent)]
    Sink(#[from] SinkError),
}
