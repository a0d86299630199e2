use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use serde::Serialize;

use crate::{
    error::LedgerError,
    types::{SubmissionRequest, TxHandle},
};

/// Header-level facts about a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockSummary {
    /// Block height.
    pub number: u64,
    /// Block timestamp in unix seconds.
    pub timestamp: u64,
    /// Number of transactions in the block.
    pub transaction_count: u64,
    /// Resource consumed by the block.
    pub gas_used: u64,
    /// Resource limit of the block.
    pub gas_limit: u64,
}

impl BlockSummary {
    /// Fraction of the block's resource limit that was consumed.
    pub fn gas_utilization(&self) -> Option<f64> {
        (self.gas_limit > 0).then(|| self.gas_used as f64 / self.gas_limit as f64)
    }
}

/// Inclusion facts about a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSummary {
    /// Height of the containing block.
    pub block_number: u64,
    /// Whether execution succeeded.
    pub succeeded: bool,
}

/// The remote ledger capabilities the harness consumes.
///
/// Every call is a network round-trip. A `None` receipt means the handle has
/// not been included yet, not that it was rejected.
#[async_trait]
pub trait LedgerApi: Send + Sync {
    /// Submits a transfer and returns its handle once the ledger queued it.
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxHandle, LedgerError>;

    /// Returns the next sequence number the ledger expects from `account`.
    async fn sequence_number(&self, account: Address) -> Result<u64, LedgerError>;

    /// Returns the balance of `account`.
    async fn balance(&self, account: Address) -> Result<U256, LedgerError>;

    /// Returns the current canonical height.
    async fn block_height(&self) -> Result<u64, LedgerError>;

    /// Returns the block at `height`, if it exists.
    async fn block(&self, height: u64) -> Result<Option<BlockSummary>, LedgerError>;

    /// Returns the receipt of `handle`, if it has been included.
    async fn receipt(&self, handle: TxHandle) -> Result<Option<ReceiptSummary>, LedgerError>;
}
