//! Block cadence analysis of recent history.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use tracing::info;

use crate::{
    aggregator::{CadenceStats, Measurement, block_cadence, theoretical_capacity},
    api::{BlockSummary, LedgerApi},
    error::SetupError,
};

const BLOCK_FETCH_CONCURRENCY: usize = 16;

/// Cadence and capacity of the most recent blocks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockTimeReport {
    /// First analysed height.
    pub from_height: u64,
    /// Last analysed height.
    pub to_height: u64,
    /// Blocks fetched.
    pub blocks_analyzed: u64,
    /// Spacing statistics.
    pub cadence: Option<CadenceStats>,
    /// Target spacing in seconds.
    pub target_secs: u64,
    /// Intervals equal to the target.
    pub on_target: u64,
    /// Intervals shorter than the target.
    pub faster: u64,
    /// Intervals longer than the target.
    pub slower: u64,
    /// Resource limit of the newest block.
    pub gas_limit: Option<u64>,
    /// Transactions per second the ledger could include at most.
    pub theoretical_capacity: Measurement,
    /// Mean transactions per block.
    pub tx_per_block: Measurement,
    /// Largest transaction count of a single block.
    pub max_transactions: u64,
}

/// Analyses the last `count` block intervals against `target` spacing.
pub async fn verify_block_time<L: LedgerApi + ?Sized>(
    api: &L,
    count: u64,
    gas_per_tx: u64,
    target: Duration,
) -> Result<BlockTimeReport, SetupError> {
    let to_height = api.block_height().await.map_err(SetupError::Unreachable)?;
    let from_height = to_height.saturating_sub(count);

    let blocks: Vec<BlockSummary> = stream::iter(from_height..=to_height)
        .map(|height| api.block(height))
        .buffered(BLOCK_FETCH_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await
        .map_err(SetupError::Unreachable)?
        .into_iter()
        .flatten()
        .collect();

    let cadence = block_cadence(None, &blocks);
    let gas_limit = blocks.last().map(|block| block.gas_limit);
    let target_secs = target.as_secs();

    let (mut on_target, mut faster, mut slower) = (0, 0, 0);
    for pair in blocks.windows(2) {
        if pair[1].number != pair[0].number + 1 {
            continue;
        }
        let interval = pair[1].timestamp.saturating_sub(pair[0].timestamp);
        match interval.cmp(&target_secs) {
            std::cmp::Ordering::Less => faster += 1,
            std::cmp::Ordering::Equal => on_target += 1,
            std::cmp::Ordering::Greater => slower += 1,
        }
    }

    let transactions: u64 = blocks.iter().map(|block| block.transaction_count).sum();
    let report = BlockTimeReport {
        from_height,
        to_height,
        blocks_analyzed: blocks.len() as u64,
        theoretical_capacity: theoretical_capacity(cadence.as_ref(), gas_limit, gas_per_tx),
        cadence,
        target_secs,
        on_target,
        faster,
        slower,
        gas_limit,
        tx_per_block: Measurement::ratio(
            transactions as f64,
            blocks.len() as f64,
            "no blocks analyzed",
        ),
        max_transactions: blocks.iter().map(|block| block.transaction_count).max().unwrap_or(0),
    };

    info!(
        from_height,
        to_height,
        mean_secs = report.cadence.map(|c| c.mean_secs),
        on_target,
        faster,
        slower,
        capacity = report.theoretical_capacity.value(),
        "block time analysed"
    );
    Ok(report)
}
