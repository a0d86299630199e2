//! Records exchanged between the generator, tracker and poller.

use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::LedgerError;

/// Opaque reference to an accepted submission, used to query inclusion.
pub type TxHandle = B256;

/// Maximum length in bytes of a failure message kept for diagnostics.
pub(crate) const MAX_REASON_LEN: usize = 120;

/// A single value transfer to be submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    /// Account authorizing the transfer.
    pub sender: Address,
    /// Account receiving the value.
    pub recipient: Address,
    /// Amount transferred, in the ledger's smallest unit.
    pub value: U256,
    /// Resource limit attached to the transaction.
    pub gas_limit: u64,
    /// Per-sender sequence number.
    pub nonce: u64,
    /// Optional explicit price per unit of resource.
    pub gas_price: Option<u128>,
}

/// Classes of submission failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The ledger refused the submission.
    Rejected,
    /// The submission did not complete within its timeout.
    TimedOut,
    /// The submission never reached the ledger.
    Transport,
    /// The submission could not be built or signed.
    Malformed,
}

/// Why a submission was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionFailure {
    /// Failure class.
    pub kind: FailureKind,
    /// Human readable reason, truncated.
    pub reason: String,
}

impl SubmissionFailure {
    /// Creates a failure of the given kind, truncating long reasons.
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            let mut cut = MAX_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason.truncate(cut);
        }
        Self { kind, reason }
    }

}

impl From<&LedgerError> for SubmissionFailure {
    fn from(error: &LedgerError) -> Self {
        Self::new(error.failure_kind(), error.to_string())
    }
}

/// The result of dispatching one [`SubmissionRequest`].
///
/// Exactly one of `handle` and `failure` is set.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    /// The dispatched request.
    pub request: SubmissionRequest,
    /// Handle returned by the ledger when the request was accepted.
    pub handle: Option<TxHandle>,
    /// Failure description when the request was not accepted.
    pub failure: Option<SubmissionFailure>,
    /// When the request was handed to the ledger API.
    pub submitted_at: Instant,
    /// Round-trip time of the submit call.
    pub latency: Duration,
}

impl SubmissionOutcome {
    /// Outcome of an accepted submission.
    pub const fn accepted(
        request: SubmissionRequest,
        handle: TxHandle,
        submitted_at: Instant,
        latency: Duration,
    ) -> Self {
        Self { request, handle: Some(handle), failure: None, submitted_at, latency }
    }

    /// Outcome of a submission that was not accepted.
    pub const fn failed(
        request: SubmissionRequest,
        failure: SubmissionFailure,
        submitted_at: Instant,
        latency: Duration,
    ) -> Self {
        Self { request, handle: None, failure: Some(failure), submitted_at, latency }
    }

    /// Returns true if the ledger accepted the submission into its queue.
    pub const fn is_accepted(&self) -> bool {
        self.handle.is_some()
    }
}

/// Inclusion status of an accepted submission as last observed by the poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionRecord {
    /// The submission handle.
    pub handle: TxHandle,
    /// Whether the submission is part of the canonical history.
    pub included: bool,
    /// Containing block height, set iff included.
    pub block: Option<u64>,
    /// Whether execution succeeded. Only meaningful when included.
    pub succeeded: bool,
    /// When this status was observed.
    pub observed_at: Instant,
}

impl InclusionRecord {
    /// A handle observed in the given block.
    pub const fn included(
        handle: TxHandle,
        block: u64,
        succeeded: bool,
        observed_at: Instant,
    ) -> Self {
        Self { handle, included: true, block: Some(block), succeeded, observed_at }
    }

    /// A handle with no observed inclusion.
    pub const fn unresolved(handle: TxHandle, observed_at: Instant) -> Self {
        Self { handle, included: false, block: None, succeeded: false, observed_at }
    }
}

/// Time and height span over which a run's rates are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunWindow {
    /// Wall-clock start of the send phase.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end of the inclusion phase.
    pub finished_at: DateTime<Utc>,
    /// Ledger height read before any submission.
    pub start_height: u64,
    /// Ledger height read after the inclusion phase.
    pub end_height: Option<u64>,
}

impl RunWindow {
    /// Number of blocks produced inside the window, if the end height is known.
    pub fn blocks_produced(&self) -> Option<u64> {
        self.end_height.map(|end| end.saturating_sub(self.start_height))
    }
}

/// Balance of an account at a run boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    /// The account.
    pub account: Address,
    /// Observed balance.
    pub amount: U256,
    /// When the balance was read.
    pub taken_at: DateTime<Utc>,
}
