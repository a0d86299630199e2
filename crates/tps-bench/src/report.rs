//! Structured result of a benchmark run.

use serde::Serialize;

use crate::{
    aggregator::ThroughputMetrics,
    api::BlockSummary,
    generator::{SendPhase, Strategy},
    invariant::{CheckResult, InvariantCheck},
    poller::{InclusionEstimate, InclusionReport, PollStatus},
    runner::RunConfig,
    sequence::SequenceSpan,
    tracker::OutcomeCounts,
    types::{BalanceSnapshot, RunWindow},
};

/// Parameters the run was started with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEcho {
    /// Strategy name.
    pub strategy: &'static str,
    /// Group size of the steady-batch strategy.
    pub batch_size: Option<usize>,
    /// Requests the run aimed for.
    pub target_count: u64,
    /// Send phase duration bound.
    pub duration_secs: Option<f64>,
    /// Number of senders.
    pub senders: usize,
    /// Spacing of poll rounds.
    pub poll_interval_secs: f64,
    /// Inclusion phase bound.
    pub inclusion_timeout_secs: f64,
    /// Sampled completion threshold.
    pub completion_threshold: f64,
    /// Largest handle set checked exhaustively.
    pub sampling_threshold: usize,
    /// Handles checked per sampled round.
    pub sample_cap: usize,
    /// Resource cost of one transaction.
    pub gas_per_tx: u64,
    /// Configured resource limit per block.
    pub gas_limit_per_block: Option<u64>,
    /// Configured invariant checks.
    pub invariants: Vec<InvariantCheck>,
}

impl From<&RunConfig> for ConfigEcho {
    fn from(config: &RunConfig) -> Self {
        let batch_size = match config.strategy {
            Strategy::SteadyBatch { batch_size, .. } => Some(batch_size),
            _ => None,
        };
        Self {
            strategy: config.strategy.name(),
            batch_size,
            target_count: config.target_count,
            duration_secs: config.duration.map(|d| d.as_secs_f64()),
            senders: config.senders.len(),
            poll_interval_secs: config.poller.poll_interval.as_secs_f64(),
            inclusion_timeout_secs: config.poller.timeout.as_secs_f64(),
            completion_threshold: config.poller.completion_threshold,
            sampling_threshold: config.poller.sampling_threshold,
            sample_cap: config.poller.sample_cap,
            gas_per_tx: config.gas_per_tx,
            gas_limit_per_block: config.gas_limit_per_block,
            invariants: config.invariants.clone(),
        }
    }
}

/// Send phase figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendSummary {
    /// Strategy name.
    pub strategy: &'static str,
    /// Requests handed to the ledger.
    pub dispatched: u64,
    /// Requests accepted.
    pub accepted: u64,
    /// Requests not accepted.
    pub failed: u64,
    /// Dispatch groups.
    pub groups: u64,
    /// Phase length.
    pub duration_secs: f64,
    /// Whether the phase stopped before its target.
    pub stopped_early: bool,
}

impl From<&SendPhase> for SendSummary {
    fn from(phase: &SendPhase) -> Self {
        Self {
            strategy: phase.strategy,
            dispatched: phase.dispatched,
            accepted: phase.accepted,
            failed: phase.failed,
            groups: phase.groups,
            duration_secs: phase.duration().as_secs_f64(),
            stopped_early: phase.stopped_early,
        }
    }
}

/// Inclusion phase figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InclusionSummary {
    /// Why polling stopped.
    pub status: PollStatus,
    /// Included-count estimate.
    pub estimate: InclusionEstimate,
    /// Handles observed included.
    pub verified: u64,
    /// Handles never observed included.
    pub unresolved: u64,
    /// Included handles whose execution failed.
    pub reverted: u64,
    /// Failed receipt queries.
    pub query_errors: u64,
    /// Poll rounds run.
    pub rounds: u64,
    /// Distinct heights holding tracked handles.
    pub heights_observed: u64,
    /// Phase length.
    pub duration_secs: f64,
}

impl From<&InclusionReport> for InclusionSummary {
    fn from(report: &InclusionReport) -> Self {
        Self {
            status: report.status,
            estimate: report.estimate,
            verified: report.records.len() as u64 - report.unresolved,
            unresolved: report.unresolved,
            reverted: report.reverted,
            query_errors: report.query_errors,
            rounds: report.rounds.len() as u64,
            heights_observed: report.heights.len() as u64,
            duration_secs: report.elapsed.as_secs_f64(),
        }
    }
}

/// Balances read at the run boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceReport {
    /// Read before any submission.
    pub before: Vec<BalanceSnapshot>,
    /// Read after the inclusion phase.
    pub after: Vec<BalanceSnapshot>,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Run parameters.
    pub config: ConfigEcho,
    /// Time and height span.
    pub window: RunWindow,
    /// Outcome counts by class.
    pub submissions: OutcomeCounts,
    /// Send phase.
    pub send: SendSummary,
    /// Inclusion phase.
    pub inclusion: InclusionSummary,
    /// Derived figures.
    pub metrics: ThroughputMetrics,
    /// Analysed blocks.
    pub blocks: Vec<BlockSummary>,
    /// Sampled failure messages.
    pub failure_samples: Vec<String>,
    /// Sequence numbers used per sender.
    pub sequences: Vec<SequenceSpan>,
    /// Invariant verdicts.
    pub invariants: Vec<CheckResult>,
    /// Boundary balances.
    pub balances: BalanceReport,
}

impl RunReport {
    /// Requests accepted by the ledger.
    pub const fn sent(&self) -> u64 {
        self.submissions.accepted
    }

    /// Included requests, exact or estimated.
    pub const fn included(&self) -> u64 {
        self.inclusion.estimate.included
    }

    /// Returns true if every invariant check passed.
    pub fn invariants_passed(&self) -> bool {
        self.invariants.iter().all(|check| check.passed)
    }
}
