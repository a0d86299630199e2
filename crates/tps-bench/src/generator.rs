//! Transaction load generation.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::{
    task::JoinSet,
    time::{Instant, MissedTickBehavior, interval, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::LedgerApi,
    error::{LedgerError, SetupError},
    metrics::HarnessMetrics,
    sequence::{SequenceAllocator, SequenceCounter},
    tracker::{OutcomeCounts, SubmissionTracker},
    types::{SubmissionOutcome, SubmissionRequest},
};

/// How load is pushed at the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Build every request up front and dispatch them all at once.
    Burst,
    /// Dispatch fixed-size groups, each fully recorded before the next starts.
    SteadyBatch {
        /// Requests per group.
        batch_size: usize,
        /// Optional pause between groups.
        pause: Option<Duration>,
    },
    /// Keep the ledger's queue full for the whole duration.
    Saturation(SaturationConfig),
}

impl Strategy {
    /// Short name used in logs and reports.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Burst => "burst",
            Self::SteadyBatch { .. } => "steady_batch",
            Self::Saturation(_) => "saturation",
        }
    }
}

/// Parameters of the saturation strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct SaturationConfig {
    /// Requests pushed before the refill loop starts.
    pub initial_fill: u64,
    /// Requests awaited together during the fill phase.
    pub fill_chunk: usize,
    /// Spacing between refills.
    pub refill_interval: Duration,
    /// Upper bound on a single refill.
    pub refill_cap: u64,
    /// How consumed queue slots are estimated.
    pub estimate: RefillEstimate,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            initial_fill: 8_000,
            fill_chunk: 100,
            refill_interval: Duration::from_secs(1),
            refill_cap: 4_000,
            estimate: RefillEstimate::default(),
        }
    }
}

/// Built-in [`BacklogEstimator`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefillEstimate {
    /// New blocks times an assumed per-block count.
    BlockProgress {
        /// Requests assumed to be consumed per block.
        assumed_per_block: u64,
    },
    /// Transaction counts of the new blocks.
    BlockContent,
}

impl Default for RefillEstimate {
    fn default() -> Self {
        Self::BlockProgress { assumed_per_block: 1_000 }
    }
}

impl RefillEstimate {
    /// Creates the estimator.
    pub fn estimator(self) -> Box<dyn BacklogEstimator> {
        match self {
            Self::BlockProgress { assumed_per_block } => {
                Box::new(BlockProgressEstimator::new(assumed_per_block))
            }
            Self::BlockContent => Box::new(BlockContentEstimator::default()),
        }
    }
}

/// Estimates how many queued requests the ledger consumed since the last call.
///
/// Implementations are approximations; an exact pending-count query can be
/// plugged in where the ledger offers one.
#[async_trait]
pub trait BacklogEstimator: Send + std::fmt::Debug {
    /// Records the current ledger position as the baseline.
    async fn prime(&mut self, api: &dyn LedgerApi) -> Result<(), LedgerError>;

    /// Queue slots consumed since the previous call.
    async fn consumed(&mut self, api: &dyn LedgerApi) -> Result<u64, LedgerError>;
}

/// Height delta times a fixed per-block count.
#[derive(Debug, Clone)]
pub struct BlockProgressEstimator {
    assumed_per_block: u64,
    last_height: Option<u64>,
}

impl BlockProgressEstimator {
    /// Creates an estimator assuming `assumed_per_block` requests per block.
    pub const fn new(assumed_per_block: u64) -> Self {
        Self { assumed_per_block, last_height: None }
    }
}

#[async_trait]
impl BacklogEstimator for BlockProgressEstimator {
    async fn prime(&mut self, api: &dyn LedgerApi) -> Result<(), LedgerError> {
        self.last_height = Some(api.block_height().await?);
        Ok(())
    }

    async fn consumed(&mut self, api: &dyn LedgerApi) -> Result<u64, LedgerError> {
        let height = api.block_height().await?;
        let delta = self.last_height.map_or(0, |last| height.saturating_sub(last));
        self.last_height = Some(height);
        Ok(delta.saturating_mul(self.assumed_per_block))
    }
}

/// Sum of transaction counts of every new block.
#[derive(Debug, Clone, Default)]
pub struct BlockContentEstimator {
    last_height: Option<u64>,
}

#[async_trait]
impl BacklogEstimator for BlockContentEstimator {
    async fn prime(&mut self, api: &dyn LedgerApi) -> Result<(), LedgerError> {
        self.last_height = Some(api.block_height().await?);
        Ok(())
    }

    async fn consumed(&mut self, api: &dyn LedgerApi) -> Result<u64, LedgerError> {
        let height = api.block_height().await?;
        let Some(last) = self.last_height else {
            self.last_height = Some(height);
            return Ok(0);
        };

        let mut consumed = 0;
        for number in last + 1..=height {
            if let Some(block) = api.block(number).await? {
                consumed += block.transaction_count;
            }
        }
        self.last_height = Some(height);
        Ok(consumed)
    }
}

/// Who receives each transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecipientPolicy {
    /// The next sender in round-robin order.
    #[default]
    NextSender,
    /// The sender itself.
    SelfTransfer,
    /// A fixed account.
    Fixed(Address),
}

/// Shape of every generated transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTemplate {
    /// Value moved by each transfer.
    pub value: U256,
    /// Resource limit of each transfer.
    pub gas_limit: u64,
    /// Explicit price; the client default when unset.
    pub gas_price: Option<u128>,
    /// Recipient selection.
    pub recipients: RecipientPolicy,
}

impl Default for TransferTemplate {
    fn default() -> Self {
        Self {
            value: U256::from(1_000_000_000_000_000u64),
            gas_limit: 21_000,
            gas_price: None,
            recipients: RecipientPolicy::default(),
        }
    }
}

/// Summary of a send phase.
#[derive(Debug, Clone)]
pub struct SendPhase {
    /// Strategy name.
    pub strategy: &'static str,
    /// Requests handed to the ledger API.
    pub dispatched: u64,
    /// Requests accepted into the ledger queue.
    pub accepted: u64,
    /// Requests not accepted.
    pub failed: u64,
    /// Dispatch groups issued.
    pub groups: u64,
    /// When the first request was dispatched.
    pub started: Instant,
    /// When the last outcome was recorded.
    pub finished: Instant,
    /// Whether the phase stopped before reaching its target.
    pub stopped_early: bool,
}

impl SendPhase {
    /// Wall-clock duration of the phase.
    pub fn duration(&self) -> Duration {
        self.finished.duration_since(self.started)
    }
}

#[derive(Debug, Default)]
struct Progress {
    dispatched: u64,
    groups: u64,
    stopped_early: bool,
}

/// Builds transfers round-robin over the seeded senders and dispatches them.
///
/// Every outcome is streamed into the [`SubmissionTracker`] as it completes.
/// Failed submissions are recorded and never retried.
#[derive(Debug)]
pub struct LoadGenerator<L> {
    api: Arc<L>,
    tracker: Arc<SubmissionTracker>,
    senders: Vec<(Address, Arc<SequenceCounter>)>,
    template: TransferTemplate,
    submit_timeout: Duration,
    send_timeout: Option<Duration>,
    shutdown: CancellationToken,
    metrics: HarnessMetrics,
}

impl<L: LedgerApi + 'static> LoadGenerator<L> {
    /// Creates a generator over every sender of `allocator`.
    pub fn new(
        api: Arc<L>,
        tracker: Arc<SubmissionTracker>,
        allocator: &SequenceAllocator,
        template: TransferTemplate,
    ) -> Result<Self, SetupError> {
        let senders: Vec<_> = allocator
            .senders()
            .into_iter()
            .filter_map(|sender| allocator.counter(&sender).map(|counter| (sender, counter)))
            .collect();
        if senders.is_empty() {
            return Err(SetupError::InvalidConfig("no senders were seeded".into()));
        }

        Ok(Self {
            api,
            tracker,
            senders,
            template,
            submit_timeout: Duration::from_secs(10),
            send_timeout: None,
            shutdown: CancellationToken::new(),
            metrics: HarnessMetrics::default(),
        })
    }

    /// Bounds every submit call.
    pub const fn with_submit_timeout(mut self, submit_timeout: Duration) -> Self {
        self.submit_timeout = submit_timeout;
        self
    }

    /// Stops dispatching new requests after `send_timeout`.
    pub const fn with_send_timeout(mut self, send_timeout: Option<Duration>) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Stops dispatching new requests once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The tracker outcomes are recorded into.
    pub fn tracker(&self) -> &Arc<SubmissionTracker> {
        &self.tracker
    }

    /// Generates up to `target` requests with `strategy`.
    ///
    /// `duration` bounds the phase for the batch and saturation strategies
    /// and is required by the latter.
    pub async fn run(
        &self,
        strategy: &Strategy,
        target: u64,
        duration: Option<Duration>,
    ) -> Result<SendPhase, SetupError> {
        match strategy {
            Strategy::Saturation(config) => {
                let mut estimator = config.estimate.estimator();
                self.run_saturation(config, target, duration, estimator.as_mut()).await
            }
            _ => {
                let started = Instant::now();
                let deadline = self.deadline(started, duration);
                let before = self.starting(strategy.name(), target, duration);
                let progress = match strategy {
                    Strategy::SteadyBatch { batch_size, pause } => {
                        self.steady_batch(target, *batch_size, *pause, deadline).await?
                    }
                    _ => self.burst(target).await,
                };
                Ok(self.finished(strategy.name(), started, before, progress))
            }
        }
    }

    /// Runs the saturation strategy with a caller-supplied estimator.
    pub async fn run_saturation(
        &self,
        config: &SaturationConfig,
        target: u64,
        duration: Option<Duration>,
        estimator: &mut dyn BacklogEstimator,
    ) -> Result<SendPhase, SetupError> {
        const NAME: &str = "saturation";

        let started = Instant::now();
        let deadline = self.deadline(started, duration).ok_or_else(|| {
            SetupError::InvalidConfig("saturation strategy requires a duration".into())
        })?;
        let before = self.starting(NAME, target, duration);
        let progress = self.saturate(config, target, deadline, estimator).await;
        Ok(self.finished(NAME, started, before, progress))
    }

    fn deadline(&self, started: Instant, duration: Option<Duration>) -> Option<Instant> {
        [duration, self.send_timeout].into_iter().flatten().min().map(|limit| started + limit)
    }

    fn starting(&self, strategy: &str, target: u64, duration: Option<Duration>) -> OutcomeCounts {
        info!(strategy, target, senders = self.senders.len(), ?duration, "starting send phase");
        self.tracker.counts()
    }

    fn finished(
        &self,
        strategy: &'static str,
        started: Instant,
        before: OutcomeCounts,
        progress: Progress,
    ) -> SendPhase {
        let after = self.tracker.counts();
        let phase = SendPhase {
            strategy,
            dispatched: progress.dispatched,
            accepted: after.accepted - before.accepted,
            failed: after.failed() - before.failed(),
            groups: progress.groups,
            started,
            finished: Instant::now(),
            stopped_early: progress.stopped_early,
        };

        info!(
            strategy,
            dispatched = phase.dispatched,
            accepted = phase.accepted,
            failed = phase.failed,
            groups = phase.groups,
            stopped_early = phase.stopped_early,
            elapsed = ?phase.duration(),
            "send phase finished"
        );
        phase
    }

    fn recipient(&self, index: usize) -> Address {
        match self.template.recipients {
            RecipientPolicy::NextSender => self.senders[(index + 1) % self.senders.len()].0,
            RecipientPolicy::SelfTransfer => self.senders[index].0,
            RecipientPolicy::Fixed(recipient) => recipient,
        }
    }

    fn request(&self, index: usize, nonce: u64) -> SubmissionRequest {
        SubmissionRequest {
            sender: self.senders[index].0,
            recipient: self.recipient(index),
            value: self.template.value,
            gas_limit: self.template.gas_limit,
            nonce,
            gas_price: self.template.gas_price,
        }
    }

    /// Builds the `position`-th request of the run, allocating its nonce.
    fn next_request(&self, position: u64) -> SubmissionRequest {
        let index = (position % self.senders.len() as u64) as usize;
        self.request(index, self.senders[index].1.next())
    }

    fn build(&self, from: u64, count: u64) -> Vec<SubmissionRequest> {
        (from..from + count).map(|position| self.next_request(position)).collect()
    }

    async fn dispatch_group(&self, requests: Vec<SubmissionRequest>) {
        join_all(requests.into_iter().map(|request| {
            dispatch(&*self.api, &self.tracker, &self.metrics, request, self.submit_timeout)
        }))
        .await;
    }

    async fn burst(&self, target: u64) -> Progress {
        if target == 0 {
            return Progress::default();
        }

        // Reserve each sender's share in one step, then interleave.
        let count = self.senders.len() as u64;
        let ranges: Vec<_> = self
            .senders
            .iter()
            .enumerate()
            .map(|(index, (_, counter))| {
                let share = target / count + u64::from((index as u64) < target % count);
                counter.reserve(share)
            })
            .collect();
        let requests: Vec<_> = (0..target)
            .map(|position| {
                let index = (position % count) as usize;
                self.request(index, ranges[index].start + position / count)
            })
            .collect();

        debug!(requests = requests.len(), "burst built");
        self.dispatch_group(requests).await;
        Progress { dispatched: target, groups: 1, stopped_early: false }
    }

    async fn steady_batch(
        &self,
        target: u64,
        batch_size: usize,
        pause: Option<Duration>,
        deadline: Option<Instant>,
    ) -> Result<Progress, SetupError> {
        if batch_size == 0 {
            return Err(SetupError::InvalidConfig("batch size must be positive".into()));
        }

        let batch = batch_size as u64;
        let groups = target.div_ceil(batch);
        let mut progress = Progress::default();

        for group in 0..groups {
            if self.should_stop(deadline) {
                progress.stopped_early = true;
                break;
            }

            let size = batch.min(target - progress.dispatched);
            let requests = self.build(progress.dispatched, size);
            self.dispatch_group(requests).await;
            progress.dispatched += size;
            progress.groups += 1;

            debug!(group, dispatched = progress.dispatched, "batch recorded");
            if group % 10 == 9 {
                info!(groups = progress.groups, dispatched = progress.dispatched, "batch progress");
            }

            // A pause never runs past the deadline; the next check stops the phase.
            if let Some(pause) = pause.filter(|_| group + 1 < groups) {
                let wake = Instant::now() + pause;
                let wake = deadline.map_or(wake, |deadline| wake.min(deadline));
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = sleep_until(wake) => {}
                }
            }
        }

        Ok(progress)
    }

    async fn saturate(
        &self,
        config: &SaturationConfig,
        target: u64,
        deadline: Instant,
        estimator: &mut dyn BacklogEstimator,
    ) -> Progress {
        let mut progress = Progress::default();
        let fill = config.initial_fill.min(target);
        let chunk = config.fill_chunk.max(1) as u64;

        while progress.dispatched < fill {
            if self.should_stop(Some(deadline)) {
                progress.stopped_early = true;
                return progress;
            }
            let size = chunk.min(fill - progress.dispatched);
            let requests = self.build(progress.dispatched, size);
            self.dispatch_group(requests).await;
            progress.dispatched += size;
            progress.groups += 1;
        }
        info!(dispatched = progress.dispatched, "initial fill complete");

        if let Err(error) = estimator.prime(&*self.api).await {
            warn!(%error, "failed to prime backlog estimator");
        }

        let mut ticker = interval(config.refill_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut in_flight = JoinSet::new();
        while progress.dispatched < target {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    progress.stopped_early = true;
                    break;
                }
                _ = sleep_until(deadline) => break,
                _ = ticker.tick() => {}
            }

            while let Some(result) = in_flight.try_join_next() {
                if let Err(error) = result {
                    warn!(%error, "submission task failed");
                }
            }

            let consumed = match estimator.consumed(&*self.api).await {
                Ok(consumed) => consumed,
                Err(error) => {
                    warn!(%error, "backlog estimate failed, skipping refill");
                    0
                }
            };
            let refill = consumed.min(config.refill_cap).min(target - progress.dispatched);

            for request in self.build(progress.dispatched, refill) {
                let api = Arc::clone(&self.api);
                let tracker = Arc::clone(&self.tracker);
                let metrics = self.metrics.clone();
                let submit_timeout = self.submit_timeout;
                in_flight.spawn(async move {
                    dispatch(&*api, &tracker, &metrics, request, submit_timeout).await;
                });
            }
            progress.dispatched += refill;
            if refill > 0 {
                progress.groups += 1;
            }

            info!(
                consumed,
                refill,
                in_flight = in_flight.len(),
                dispatched = progress.dispatched,
                "refilled backlog"
            );
        }

        while let Some(result) = in_flight.join_next().await {
            if let Err(error) = result {
                warn!(%error, "submission task failed");
            }
        }
        progress
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        self.shutdown.is_cancelled() || deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Submits one request under `submit_timeout` and records its outcome.
async fn dispatch<L: LedgerApi + ?Sized>(
    api: &L,
    tracker: &SubmissionTracker,
    metrics: &HarnessMetrics,
    request: SubmissionRequest,
    submit_timeout: Duration,
) {
    let submitted_at = Instant::now();
    let result = timeout(submit_timeout, api.submit(&request)).await;
    let latency = submitted_at.elapsed();
    metrics.submit_duration.record(latency.as_secs_f64());

    let outcome = match result {
        Ok(Ok(handle)) => {
            metrics.submissions_accepted.increment(1);
            debug!(%handle, sender = %request.sender, nonce = request.nonce, "submission accepted");
            SubmissionOutcome::accepted(request, handle, submitted_at, latency)
        }
        Ok(Err(error)) => {
            metrics.submissions_failed.increment(1);
            debug!(%error, sender = %request.sender, nonce = request.nonce, "submission failed");
            SubmissionOutcome::failed(request, (&error).into(), submitted_at, latency)
        }
        Err(_) => {
            metrics.submissions_failed.increment(1);
            debug!(sender = %request.sender, nonce = request.nonce, "submission timed out");
            let error = LedgerError::Timeout(submit_timeout);
            SubmissionOutcome::failed(request, (&error).into(), submitted_at, latency)
        }
    };
    tracker.record(outcome);
}
