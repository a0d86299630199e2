//! Derived throughput figures.
//!
//! Everything here is a pure function of recorded data. A figure that cannot
//! be computed is [`Measurement::Undefined`] rather than NaN or infinity.

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::api::BlockSummary;

/// A derived figure that is either computed from verified data or undefined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Measurement {
    /// A finite value.
    Defined(f64),
    /// The figure cannot be computed; carries the reason.
    Undefined(&'static str),
}

impl Measurement {
    /// `numerator / denominator`, undefined when the result is not finite.
    pub fn ratio(numerator: f64, denominator: f64, reason: &'static str) -> Self {
        if denominator == 0.0 {
            return Self::Undefined(reason);
        }
        Self::finite(numerator / denominator, reason)
    }

    fn finite(value: f64, reason: &'static str) -> Self {
        if value.is_finite() { Self::Defined(value) } else { Self::Undefined(reason) }
    }

    /// The value, if defined.
    pub const fn value(&self) -> Option<f64> {
        match self {
            Self::Defined(value) => Some(*value),
            Self::Undefined(_) => None,
        }
    }

    /// Returns true if the figure was computed.
    pub const fn is_defined(&self) -> bool {
        matches!(self, Self::Defined(_))
    }

    fn and_then(self, f: impl FnOnce(f64) -> Self) -> Self {
        match self {
            Self::Defined(value) => f(value),
            undefined => undefined,
        }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Defined(value) => serializer.serialize_f64(*value),
            Self::Undefined(_) => serializer.serialize_none(),
        }
    }
}

/// Spacing statistics of consecutive blocks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CadenceStats {
    /// Mean spacing in seconds.
    pub mean_secs: f64,
    /// Smallest spacing in seconds.
    pub min_secs: f64,
    /// Largest spacing in seconds.
    pub max_secs: f64,
    /// Number of consecutive pairs measured.
    pub intervals: u64,
}

/// Throughput of a single block relative to its predecessor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlockRate {
    /// Block height.
    pub number: u64,
    /// Transactions in the block.
    pub transactions: u64,
    /// Seconds since the previous block.
    pub interval_secs: u64,
    /// Transactions per second over that interval.
    pub tps: Measurement,
}

/// Distribution of a set of durations, in seconds.
///
/// Percentiles use the nearest-rank method. Every figure is undefined when
/// there are no samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    /// Durations measured.
    pub samples: u64,
    /// Mean.
    pub mean_secs: Measurement,
    /// Smallest sample.
    pub min_secs: Measurement,
    /// Median.
    pub p50_secs: Measurement,
    /// 99th percentile.
    pub p99_secs: Measurement,
    /// Largest sample.
    pub max_secs: Measurement,
}

impl LatencyStats {
    /// Summarises `samples`.
    pub fn from_samples(samples: &[Duration]) -> Self {
        const EMPTY: Measurement = Measurement::Undefined("no latency samples");

        let mut secs: Vec<f64> = samples.iter().map(Duration::as_secs_f64).collect();
        secs.sort_unstable_by(f64::total_cmp);
        let (Some(&min), Some(&max)) = (secs.first(), secs.last()) else {
            return Self {
                samples: 0,
                mean_secs: EMPTY,
                min_secs: EMPTY,
                p50_secs: EMPTY,
                p99_secs: EMPTY,
                max_secs: EMPTY,
            };
        };

        let rank = |quantile: f64| {
            let index = (quantile * secs.len() as f64).ceil() as usize;
            Measurement::Defined(secs[index.clamp(1, secs.len()) - 1])
        };
        Self {
            samples: secs.len() as u64,
            mean_secs: Measurement::ratio(secs.iter().sum(), secs.len() as f64, "no samples"),
            min_secs: Measurement::Defined(min),
            p50_secs: rank(0.50),
            p99_secs: rank(0.99),
            max_secs: Measurement::Defined(max),
        }
    }
}

/// Raw data the figures are derived from.
#[derive(Debug, Clone, Copy)]
pub struct AggregateInput<'a> {
    /// Submissions accepted during the send phase.
    pub accepted: u64,
    /// Wall-clock length of the send phase.
    pub send_duration: Duration,
    /// Submissions included, exact or estimated.
    pub included: u64,
    /// Wall-clock length of the inclusion phase.
    pub inclusion_duration: Duration,
    /// Blocks produced inside the run window, if the end height is known.
    pub blocks_produced: Option<u64>,
    /// Analysed blocks in ascending height order.
    pub blocks: &'a [BlockSummary],
    /// Block preceding the first analysed one, used for spacing only.
    pub baseline: Option<BlockSummary>,
    /// Resource cost of one transaction.
    pub gas_per_tx: u64,
    /// Resource limit per block; taken from the blocks when unset.
    pub gas_limit_per_block: Option<u64>,
    /// Round-trip time of every submit call.
    pub submit_latencies: &'a [Duration],
    /// Time from submission until the poller first saw each inclusion.
    pub inclusion_latencies: &'a [Duration],
}

/// Every derived figure of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThroughputMetrics {
    /// Accepted submissions per second of send phase.
    pub send_rate: Measurement,
    /// Always false: the send rate ignores backpressure and inclusion lag.
    pub send_rate_authoritative: bool,
    /// Included submissions per second of inclusion phase.
    pub inclusion_rate: Measurement,
    /// Included fraction of the accepted submissions.
    pub success_rate: Measurement,
    /// Submit call round trips.
    pub submit_latency: LatencyStats,
    /// Submission to observed inclusion. Bounded below by the poll interval.
    pub inclusion_latency: LatencyStats,
    /// Block spacing inside the window.
    pub block_cadence: Option<CadenceStats>,
    /// Transactions that fit into one block.
    pub max_tx_per_block: Option<u64>,
    /// Transactions per second the ledger could include at most.
    pub theoretical_capacity: Measurement,
    /// Inclusion rate relative to the theoretical capacity.
    pub utilization: Measurement,
    /// Blocks produced inside the run window.
    pub blocks_produced: Option<u64>,
    /// Blocks the block figures were computed from.
    pub blocks_analyzed: u64,
    /// Mean transactions per analysed block.
    pub tx_per_block: Measurement,
    /// Mean fraction of the block resource limit consumed.
    pub gas_utilization: Measurement,
    /// Highest single-block throughput.
    pub peak_block_tps: Measurement,
    /// Per-block throughput samples.
    pub block_rates: Vec<BlockRate>,
}

/// Spacing of consecutive heights. Pairs with a gap in height are skipped.
pub fn block_cadence(
    baseline: Option<&BlockSummary>,
    blocks: &[BlockSummary],
) -> Option<CadenceStats> {
    let deltas: Vec<u64> =
        consecutive(baseline, blocks).map(|(prev, next)| interval(prev, next)).collect();
    if deltas.is_empty() {
        return None;
    }

    let total: u64 = deltas.iter().sum();
    Some(CadenceStats {
        mean_secs: total as f64 / deltas.len() as f64,
        min_secs: deltas.iter().copied().min().unwrap_or_default() as f64,
        max_secs: deltas.iter().copied().max().unwrap_or_default() as f64,
        intervals: deltas.len() as u64,
    })
}

/// `floor(gas_limit / gas_per_tx) / mean_cadence`.
pub fn theoretical_capacity(
    cadence: Option<&CadenceStats>,
    gas_limit: Option<u64>,
    gas_per_tx: u64,
) -> Measurement {
    let Some(cadence) = cadence else {
        return Measurement::Undefined("no blocks produced");
    };
    let Some(max_tx) = max_tx_per_block(gas_limit, gas_per_tx) else {
        return Measurement::Undefined(if gas_per_tx == 0 {
            "zero gas per transaction"
        } else {
            "unknown block gas limit"
        });
    };
    Measurement::ratio(max_tx as f64, cadence.mean_secs, "zero block cadence")
}

fn max_tx_per_block(gas_limit: Option<u64>, gas_per_tx: u64) -> Option<u64> {
    gas_limit.and_then(|limit| limit.checked_div(gas_per_tx))
}

/// Derives every figure from `input`.
pub fn aggregate(input: &AggregateInput<'_>) -> ThroughputMetrics {
    let send_rate = Measurement::ratio(
        input.accepted as f64,
        input.send_duration.as_secs_f64(),
        "zero send duration",
    );

    let inclusion_rate = if input.blocks_produced == Some(0) {
        Measurement::Undefined("no blocks produced")
    } else {
        Measurement::ratio(
            input.included as f64,
            input.inclusion_duration.as_secs_f64(),
            "zero inclusion duration",
        )
    };

    let success_rate =
        Measurement::ratio(input.included as f64, input.accepted as f64, "nothing accepted");

    let cadence = block_cadence(input.baseline.as_ref(), input.blocks);
    let gas_limit = input.gas_limit_per_block.or_else(|| input.blocks.last().map(|b| b.gas_limit));
    let theoretical_capacity = theoretical_capacity(cadence.as_ref(), gas_limit, input.gas_per_tx);
    let utilization = inclusion_rate.and_then(|rate| {
        theoretical_capacity
            .and_then(|capacity| Measurement::ratio(rate, capacity, "zero theoretical capacity"))
    });

    let analyzed = input.blocks.len() as f64;
    let transactions: u64 = input.blocks.iter().map(|b| b.transaction_count).sum();
    let tx_per_block = Measurement::ratio(transactions as f64, analyzed, "no blocks analyzed");

    let utilizations: Vec<f64> =
        input.blocks.iter().filter_map(BlockSummary::gas_utilization).collect();
    let gas_utilization = Measurement::ratio(
        utilizations.iter().sum(),
        utilizations.len() as f64,
        "no blocks analyzed",
    );

    let block_rates: Vec<BlockRate> = consecutive(input.baseline.as_ref(), input.blocks)
        .map(|(prev, next)| {
            let interval_secs = interval(prev, next);
            BlockRate {
                number: next.number,
                transactions: next.transaction_count,
                interval_secs,
                tps: Measurement::ratio(
                    next.transaction_count as f64,
                    interval_secs as f64,
                    "zero block interval",
                ),
            }
        })
        .collect();
    let peak_block_tps = block_rates
        .iter()
        .filter_map(|rate| rate.tps.value())
        .reduce(f64::max)
        .map_or(Measurement::Undefined("no block intervals"), Measurement::Defined);

    ThroughputMetrics {
        send_rate,
        send_rate_authoritative: false,
        inclusion_rate,
        success_rate,
        submit_latency: LatencyStats::from_samples(input.submit_latencies),
        inclusion_latency: LatencyStats::from_samples(input.inclusion_latencies),
        block_cadence: cadence,
        max_tx_per_block: max_tx_per_block(gas_limit, input.gas_per_tx),
        theoretical_capacity,
        utilization,
        blocks_produced: input.blocks_produced,
        blocks_analyzed: input.blocks.len() as u64,
        tx_per_block,
        gas_utilization,
        peak_block_tps,
        block_rates,
    }
}

fn consecutive<'a>(
    baseline: Option<&'a BlockSummary>,
    blocks: &'a [BlockSummary],
) -> impl Iterator<Item = (&'a BlockSummary, &'a BlockSummary)> {
    let previous = baseline.into_iter().chain(blocks.iter());
    let next = blocks.iter().skip(usize::from(baseline.is_none()));
    previous.zip(next).filter(|(prev, next)| next.number == prev.number + 1)
}

const fn interval(prev: &BlockSummary, next: &BlockSummary) -> u64 {
    next.timestamp.saturating_sub(prev.timestamp)
}
