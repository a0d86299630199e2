//! End-to-end benchmark orchestration.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy_primitives::Address;
use chrono::Utc;
use futures::{StreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    aggregator::{AggregateInput, aggregate},
    api::{BlockSummary, LedgerApi},
    error::{RunError, SetupError},
    generator::{LoadGenerator, SendPhase, Strategy, TransferTemplate},
    invariant::{
        Expectation, InvariantCheck, InvariantVerifier, take_snapshots, take_snapshots_partial,
    },
    poller::{ConfirmationPoller, InclusionReport, PollerConfig},
    report::{BalanceReport, ConfigEcho, InclusionSummary, RunReport, SendSummary},
    sequence::SequenceAllocator,
    sink::ResultSink,
    tracker::{DEFAULT_FAILURE_SAMPLES, SubmissionTracker},
    types::RunWindow,
};

const BLOCK_FETCH_CONCURRENCY: usize = 16;

/// Inputs of a benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// Accounts sending transfers.
    pub senders: Vec<Address>,
    /// Load strategy.
    pub strategy: Strategy,
    /// Requests to generate.
    pub target_count: u64,
    /// Send phase bound; required by the saturation strategy.
    pub duration: Option<Duration>,
    /// Shape of each transfer.
    pub transfer: TransferTemplate,
    /// Bound on each submit call.
    pub submit_timeout: Duration,
    /// Hard bound on the send phase.
    pub send_timeout: Option<Duration>,
    /// Inclusion polling.
    pub poller: PollerConfig,
    /// Balance invariants checked across the run.
    pub invariants: Vec<InvariantCheck>,
    /// Resource cost of one transaction.
    pub gas_per_tx: u64,
    /// Resource limit per block; read from blocks when unset.
    pub gas_limit_per_block: Option<u64>,
    /// Most recent blocks of the window analysed.
    pub max_blocks_analyzed: u64,
    /// Failure messages kept in the report.
    pub failure_sample_cap: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            strategy: Strategy::SteadyBatch {
                batch_size: 5,
                pause: Some(Duration::from_millis(200)),
            },
            target_count: 100,
            duration: None,
            transfer: TransferTemplate::default(),
            submit_timeout: Duration::from_secs(10),
            send_timeout: None,
            poller: PollerConfig::default(),
            invariants: Vec::new(),
            gas_per_tx: 21_000,
            gas_limit_per_block: None,
            max_blocks_analyzed: 100,
            failure_sample_cap: DEFAULT_FAILURE_SAMPLES,
        }
    }
}

impl RunConfig {
    /// Sets the senders.
    pub fn with_senders(mut self, senders: Vec<Address>) -> Self {
        self.senders = senders;
        self
    }

    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the number of requests.
    pub fn with_target_count(mut self, target_count: u64) -> Self {
        self.target_count = target_count;
        self
    }

    /// Sets the send phase duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Sets the transfer template.
    pub fn with_transfer(mut self, transfer: TransferTemplate) -> Self {
        self.transfer = transfer;
        self
    }

    /// Sets the per-submission timeout.
    pub fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    /// Sets the hard send phase timeout.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = Some(send_timeout);
        self
    }

    /// Sets the poller configuration.
    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    /// Adds an invariant check.
    pub fn with_invariant(mut self, check: InvariantCheck) -> Self {
        self.invariants.push(check);
        self
    }

    /// Sets the resource cost of one transaction.
    pub fn with_gas_per_tx(mut self, gas_per_tx: u64) -> Self {
        self.gas_per_tx = gas_per_tx;
        self
    }

    /// Sets the resource limit per block.
    pub fn with_gas_limit_per_block(mut self, gas_limit: u64) -> Self {
        self.gas_limit_per_block = Some(gas_limit);
        self
    }

    /// Sets how many blocks are analysed.
    pub fn with_max_blocks_analyzed(mut self, max_blocks: u64) -> Self {
        self.max_blocks_analyzed = max_blocks;
        self
    }

    /// Sets how many failure messages are kept.
    pub fn with_failure_sample_cap(mut self, cap: usize) -> Self {
        self.failure_sample_cap = cap;
        self
    }

    /// Checks the configuration for contradictions.
    pub fn validate(&self) -> Result<(), SetupError> {
        let invalid = |reason: &str| Err(SetupError::InvalidConfig(reason.to_owned()));

        if self.senders.is_empty() {
            return invalid("at least one sender is required");
        }
        match &self.strategy {
            Strategy::Burst => {}
            Strategy::SteadyBatch { batch_size, .. } => {
                if *batch_size == 0 {
                    return invalid("batch size must be positive");
                }
            }
            Strategy::Saturation(saturation) => {
                if self.duration.is_none() {
                    return invalid("saturation strategy requires a duration");
                }
                if saturation.fill_chunk == 0 {
                    return invalid("fill chunk must be positive");
                }
                if saturation.refill_interval.is_zero() {
                    return invalid("refill interval must be positive");
                }
            }
        }
        if self.submit_timeout.is_zero() {
            return invalid("submit timeout must be positive");
        }
        if self.poller.poll_interval.is_zero() {
            return invalid("poll interval must be positive");
        }
        if !(self.poller.completion_threshold > 0.0 && self.poller.completion_threshold <= 1.0) {
            return invalid("completion threshold must be in (0, 1]");
        }
        if self.poller.sample_cap == 0 {
            return invalid("sample cap must be positive");
        }
        if self.max_blocks_analyzed == 0 {
            return invalid("at least one block must be analysed");
        }
        if self.gas_per_tx == 0 {
            return invalid("gas per transaction must be positive");
        }
        for check in &self.invariants {
            if let Expectation::Ratio { target, tolerance, .. } = check.expectation {
                if !(target > 0.0 && target.is_finite()) {
                    return invalid("ratio target must be positive");
                }
                if !(tolerance >= 0.0 && tolerance.is_finite()) {
                    return invalid("ratio tolerance must not be negative");
                }
            }
        }
        Ok(())
    }
}

/// Runs a complete benchmark against a ledger.
///
/// Only setup failures end a run early. Timeouts, rejections and violated
/// invariants are reported in the [`RunReport`].
#[derive(Debug)]
pub struct BenchmarkRunner<L> {
    api: Arc<L>,
    config: RunConfig,
    shutdown: CancellationToken,
}

impl<L: LedgerApi + 'static> BenchmarkRunner<L> {
    /// Creates a runner.
    pub fn new(api: Arc<L>, config: RunConfig) -> Self {
        Self { api, config, shutdown: CancellationToken::new() }
    }

    /// Stops dispatching and polling once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The run configuration.
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Runs the benchmark and hands the report to `sink`.
    pub async fn run_into<S: ResultSink + ?Sized>(
        &self,
        sink: &mut S,
    ) -> Result<RunReport, RunError> {
        let report = self.run().await?;
        sink.write(&report)?;
        Ok(report)
    }

    /// Runs the benchmark.
    pub async fn run(&self) -> Result<RunReport, SetupError> {
        let config = &self.config;
        config.validate()?;

        // Setup: every failure here aborts before any load is generated.
        let started_at = Utc::now();
        let start_height = self.api.block_height().await.map_err(SetupError::Unreachable)?;
        let allocator = SequenceAllocator::seed(&*self.api, &config.senders).await?;
        let verifier = InvariantVerifier::new(config.invariants.clone());
        let accounts = verifier.accounts();
        let before = take_snapshots(&*self.api, &accounts).await?;

        info!(
            start_height,
            senders = allocator.len(),
            invariant_accounts = accounts.len(),
            "setup complete"
        );

        let tracker = Arc::new(SubmissionTracker::new(config.failure_sample_cap));
        let generator = LoadGenerator::new(
            Arc::clone(&self.api),
            Arc::clone(&tracker),
            &allocator,
            config.transfer.clone(),
        )?
        .with_submit_timeout(config.submit_timeout)
        .with_send_timeout(config.send_timeout)
        .with_shutdown(self.shutdown.clone());

        let (send, inclusion) = self.load(&generator, &tracker).await?;

        let end_height = match self.api.block_height().await {
            Ok(height) => Some(height),
            Err(error) => {
                warn!(%error, "failed to read end height");
                None
            }
        };
        let window = RunWindow { started_at, finished_at: Utc::now(), start_height, end_height };
        let (baseline, blocks) = self.analysed_blocks(&window).await;
        let after = take_snapshots_partial(&*self.api, &accounts).await;

        let (submit_latencies, inclusion_latencies) = latencies(&tracker, &inclusion);
        let metrics = aggregate(&AggregateInput {
            accepted: send.accepted,
            send_duration: send.duration(),
            included: inclusion.estimate.included,
            inclusion_duration: inclusion.elapsed,
            blocks_produced: window.blocks_produced(),
            blocks: &blocks,
            baseline,
            gas_per_tx: config.gas_per_tx,
            gas_limit_per_block: config.gas_limit_per_block,
            submit_latencies: &submit_latencies,
            inclusion_latencies: &inclusion_latencies,
        });
        let invariants = verifier.verify(&before, &after);

        let report = RunReport {
            config: ConfigEcho::from(config),
            window,
            submissions: tracker.counts(),
            send: SendSummary::from(&send),
            inclusion: InclusionSummary::from(&inclusion),
            metrics,
            blocks,
            failure_samples: tracker.failure_samples(),
            sequences: allocator.spans(),
            invariants,
            balances: BalanceReport { before, after },
        };

        info!(
            sent = report.sent(),
            included = report.included(),
            unresolved = report.inclusion.unresolved,
            send_rate = report.metrics.send_rate.value(),
            inclusion_rate = report.metrics.inclusion_rate.value(),
            capacity = report.metrics.theoretical_capacity.value(),
            utilization = report.metrics.utilization.value(),
            invariants_passed = report.invariants_passed(),
            "benchmark finished"
        );
        Ok(report)
    }

    /// Send and inclusion phases. Saturation polls while it sends.
    async fn load(
        &self,
        generator: &LoadGenerator<L>,
        tracker: &Arc<SubmissionTracker>,
    ) -> Result<(SendPhase, InclusionReport), SetupError> {
        let config = &self.config;
        let mut poller_config = config.poller.clone();

        if let Strategy::Saturation(_) = config.strategy {
            poller_config.timeout += config.duration.unwrap_or_default();
            let poller = ConfirmationPoller::new(Arc::clone(&self.api), poller_config)
                .with_shutdown(self.shutdown.clone());
            let send = async {
                let phase =
                    generator.run(&config.strategy, config.target_count, config.duration).await;
                tracker.seal();
                phase
            };
            let (send, inclusion) = tokio::join!(send, poller.await_inclusion(&**tracker));
            return Ok((send?, inclusion));
        }

        let send = generator.run(&config.strategy, config.target_count, config.duration).await;
        tracker.seal();
        let send = send?;

        let poller = ConfirmationPoller::new(Arc::clone(&self.api), poller_config)
            .with_shutdown(self.shutdown.clone());
        let inclusion = poller.await_inclusion(&**tracker).await;
        Ok((send, inclusion))
    }

    /// Fetches the newest blocks of the window plus the block preceding them.
    async fn analysed_blocks(
        &self,
        window: &RunWindow,
    ) -> (Option<BlockSummary>, Vec<BlockSummary>) {
        let Some(end) = window.end_height.filter(|end| *end > window.start_height) else {
            return (None, Vec::new());
        };
        let newest = end.saturating_sub(self.config.max_blocks_analyzed) + 1;
        let first = (window.start_height + 1).max(newest);

        let api = &*self.api;
        let fetched: Vec<_> = stream::iter(first - 1..=end)
            .map(|height| async move { (height, api.block(height).await) })
            .buffered(BLOCK_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut baseline = None;
        let mut blocks = Vec::with_capacity(fetched.len());
        for (height, result) in fetched {
            match result {
                Ok(Some(block)) if height + 1 == first => baseline = Some(block),
                Ok(Some(block)) => blocks.push(block),
                Ok(None) => warn!(height, "block missing"),
                Err(error) => warn!(height, %error, "failed to fetch block"),
            }
        }
        (baseline, blocks)
    }
}

/// Submit round trips of every outcome and submission-to-inclusion times of
/// every handle seen included.
fn latencies(
    tracker: &SubmissionTracker,
    inclusion: &InclusionReport,
) -> (Vec<Duration>, Vec<Duration>) {
    let outcomes = tracker.outcomes();
    let submitted: HashMap<_, _> = outcomes
        .iter()
        .filter_map(|outcome| outcome.handle.map(|handle| (handle, outcome.submitted_at)))
        .collect();

    let submit = outcomes.iter().map(|outcome| outcome.latency).collect();
    let included = inclusion
        .records
        .iter()
        .filter(|record| record.included)
        .filter_map(|record| {
            submitted.get(&record.handle).map(|at| record.observed_at.duration_since(*at))
        })
        .collect();
    (submit, included)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::generator::SaturationConfig;

    fn base() -> RunConfig {
        RunConfig::default().with_senders(vec![Address::repeat_byte(1)])
    }

    #[rstest]
    #[case::no_senders(RunConfig::default())]
    #[case::zero_batch(base().with_strategy(Strategy::SteadyBatch { batch_size: 0, pause: None }))]
    #[case::saturation_without_duration(
        base().with_strategy(Strategy::Saturation(SaturationConfig::default()))
    )]
    #[case::zero_poll_interval(
        base().with_poller(PollerConfig::default().with_poll_interval(Duration::ZERO))
    )]
    #[case::threshold_above_one(
        base().with_poller(PollerConfig::default().with_completion_threshold(1.5))
    )]
    #[case::zero_gas(base().with_gas_per_tx(0))]
    #[case::negative_ratio(base().with_invariant(InvariantCheck::ratio(
        "split",
        Address::repeat_byte(2),
        Address::repeat_byte(3),
        -1.0
    )))]
    fn rejects_invalid_config(#[case] config: RunConfig) {
        assert!(matches!(config.validate(), Err(SetupError::InvalidConfig(_))));
    }

    #[test]
    fn default_config_with_senders_is_valid() {
        assert!(base().validate().is_ok());
        let saturation = base()
            .with_strategy(Strategy::Saturation(SaturationConfig::default()))
            .with_duration(Duration::from_secs(30));
        assert!(saturation.validate().is_ok());
    }
}
