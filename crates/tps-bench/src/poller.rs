//! Inclusion tracking for accepted submissions.

use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    sync::Arc,
    time::Duration,
};

use futures::{StreamExt, stream};
use rand::{SeedableRng, seq::index};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{LedgerApi, ReceiptSummary},
    metrics::HarnessMetrics,
    types::{InclusionRecord, TxHandle},
};

/// Two-sided 95% normal quantile.
const Z_95: f64 = 1.96;

/// A set of handles the poller tracks.
///
/// The set may grow while polling; it is snapshotted once per round.
pub trait HandleSource: Send + Sync {
    /// Current handles.
    fn snapshot(&self) -> Vec<TxHandle>;

    /// Returns true once the set will not grow any more.
    fn is_sealed(&self) -> bool;
}

impl HandleSource for [TxHandle] {
    fn snapshot(&self) -> Vec<TxHandle> {
        self.to_vec()
    }

    fn is_sealed(&self) -> bool {
        true
    }
}

impl HandleSource for Vec<TxHandle> {
    fn snapshot(&self) -> Vec<TxHandle> {
        self.clone()
    }

    fn is_sealed(&self) -> bool {
        true
    }
}

/// Configuration of a [`ConfirmationPoller`].
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Spacing between poll rounds.
    pub poll_interval: Duration,
    /// Upper bound on the whole inclusion phase.
    pub timeout: Duration,
    /// Estimated included fraction at which a sampled poll stops.
    pub completion_threshold: f64,
    /// Largest handle set checked exhaustively.
    pub sampling_threshold: usize,
    /// Handles checked per round in sampling mode.
    pub sample_cap: usize,
    /// Receipt queries in flight at once.
    pub max_concurrent_queries: usize,
    /// Seed of the sampling RNG; random when unset.
    pub seed: Option<u64>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
            completion_threshold: 0.95,
            sampling_threshold: 10_000,
            sample_cap: 1_000,
            max_concurrent_queries: 64,
            seed: None,
        }
    }
}

impl PollerConfig {
    /// Sets the poll interval.
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the inclusion phase timeout.
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the completion threshold used in sampling mode.
    pub const fn with_completion_threshold(mut self, threshold: f64) -> Self {
        self.completion_threshold = threshold;
        self
    }

    /// Sets the handle count above which polling samples.
    pub const fn with_sampling_threshold(mut self, threshold: usize) -> Self {
        self.sampling_threshold = threshold;
        self
    }

    /// Sets the per-round sample size.
    pub const fn with_sample_cap(mut self, cap: usize) -> Self {
        self.sample_cap = cap;
        self
    }

    /// Sets the receipt query concurrency.
    pub const fn with_max_concurrent_queries(mut self, max: usize) -> Self {
        self.max_concurrent_queries = max;
        self
    }

    /// Seeds the sampling RNG.
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Why polling stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// Every handle of a sealed source was observed included.
    Complete,
    /// The sampled included fraction reached the completion threshold.
    ThresholdReached,
    /// The timeout elapsed first.
    TimedOut,
    /// Polling was cancelled.
    Cancelled,
}

/// Included-count estimate of the last round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InclusionEstimate {
    /// Handles tracked.
    pub tracked: u64,
    /// Point estimate of included handles.
    pub included: u64,
    /// Lower end of the 95% confidence band.
    pub lower: u64,
    /// Upper end of the 95% confidence band.
    pub upper: u64,
    /// Whether every handle was checked.
    pub exact: bool,
    /// Handles checked to produce the estimate.
    pub sample_size: u64,
}

impl InclusionEstimate {
    fn exact(tracked: u64, included: u64) -> Self {
        Self {
            tracked,
            included,
            lower: included,
            upper: included,
            exact: true,
            sample_size: tracked,
        }
    }

    /// Extrapolates `hits` out of `sample_size` to the full set, with a
    /// finite-population corrected normal band. Never reports fewer than the
    /// `known` verified inclusions.
    fn sampled(tracked: u64, sample_size: u64, hits: u64, known: u64) -> Self {
        if sample_size == 0 || tracked == 0 {
            return Self { sample_size, ..Self::exact(tracked, known) };
        }

        let n = tracked as f64;
        let k = sample_size as f64;
        let p = hits as f64 / k;
        let correction = if tracked > 1 { ((n - k) / (n - 1.0)).max(0.0) } else { 0.0 };
        let margin = Z_95 * (p * (1.0 - p) / k * correction).sqrt();

        let clamp = |fraction: f64| ((fraction.clamp(0.0, 1.0) * n).round() as u64).max(known);
        Self {
            tracked,
            included: clamp(p),
            lower: clamp(p - margin),
            upper: clamp(p + margin).max(clamp(p)),
            exact: false,
            sample_size,
        }
    }

    /// Estimated included fraction, if anything is tracked.
    pub fn fraction(&self) -> Option<f64> {
        (self.tracked > 0).then(|| self.included as f64 / self.tracked as f64)
    }
}

/// Work done in one poll round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundSummary {
    /// Time since polling started.
    pub elapsed: Duration,
    /// Handles in the round's snapshot.
    pub tracked: u64,
    /// Receipt queries issued.
    pub queried: u64,
    /// Included estimate after the round.
    pub included: u64,
    /// Receipt queries that failed.
    pub errors: u64,
}

/// Final result of [`ConfirmationPoller::await_inclusion`].
#[derive(Debug, Clone)]
pub struct InclusionReport {
    /// Why polling stopped.
    pub status: PollStatus,
    /// Included-count estimate of the last round.
    pub estimate: InclusionEstimate,
    /// Last observed status of every tracked handle.
    pub records: Vec<InclusionRecord>,
    /// Tracked handles never observed included.
    pub unresolved: u64,
    /// Included handles whose execution failed.
    pub reverted: u64,
    /// Receipt queries that failed over the whole phase.
    pub query_errors: u64,
    /// Heights that contained at least one tracked handle.
    pub heights: BTreeSet<u64>,
    /// Per-round progress.
    pub rounds: Vec<RoundSummary>,
    /// When polling started.
    pub started: Instant,
    /// Duration of the inclusion phase.
    pub elapsed: Duration,
}

/// Polls the ledger for inclusion of accepted handles.
#[derive(Debug)]
pub struct ConfirmationPoller<L> {
    api: Arc<L>,
    config: PollerConfig,
    shutdown: CancellationToken,
    metrics: HarnessMetrics,
}

#[derive(Debug, Default)]
struct PollState {
    included: HashMap<TxHandle, InclusionRecord>,
    query_errors: u64,
}

impl<L: LedgerApi> ConfirmationPoller<L> {
    /// Creates a poller over `api`.
    pub fn new(api: Arc<L>, config: PollerConfig) -> Self {
        Self {
            api,
            config,
            shutdown: CancellationToken::new(),
            metrics: HarnessMetrics::default(),
        }
    }

    /// Stops polling once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The poller configuration.
    pub const fn config(&self) -> &PollerConfig {
        &self.config
    }

    /// Polls until every handle is included, the sampled threshold is reached
    /// or the timeout elapses. Unresolved handles are reported, not failed.
    pub async fn await_inclusion<S: HandleSource + ?Sized>(&self, source: &S) -> InclusionReport {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut rng = match self.config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = PollState::default();
        let mut rounds = Vec::new();
        let mut estimate = InclusionEstimate::default();

        let status = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break PollStatus::Cancelled,
                _ = sleep_until(deadline) => break PollStatus::TimedOut,
                _ = ticker.tick() => {}
            }

            // Sealed is read first so a sealed snapshot is known to be final.
            let sealed = source.is_sealed();
            let handles = source.snapshot();

            let round = timeout_at(deadline, self.round(&handles, &mut state, &mut rng)).await;
            let Ok((round_estimate, queried, errors)) = round else {
                break PollStatus::TimedOut;
            };
            estimate = round_estimate;

            let summary = RoundSummary {
                elapsed: started.elapsed(),
                tracked: estimate.tracked,
                queried,
                included: estimate.included,
                errors,
            };
            rounds.push(summary);

            self.metrics.poll_rounds.increment(1);
            self.metrics.receipts_queried.increment(queried);
            self.metrics.receipt_errors.increment(errors);
            self.metrics.inclusion_estimate.set(estimate.included as f64);

            info!(
                round = rounds.len(),
                tracked = estimate.tracked,
                included = estimate.included,
                exact = estimate.exact,
                queried,
                errors,
                sealed,
                "poll round finished"
            );

            if !sealed {
                continue;
            }
            if state.included.len() as u64 == estimate.tracked {
                break PollStatus::Complete;
            }
            if !estimate.exact &&
                estimate.fraction().is_some_and(|f| f >= self.config.completion_threshold)
            {
                break PollStatus::ThresholdReached;
            }
        };

        let elapsed = started.elapsed();
        if status == PollStatus::TimedOut {
            warn!(
                included = estimate.included,
                tracked = estimate.tracked,
                ?elapsed,
                "inclusion phase timed out"
            );
        }

        self.finish(source, state, status, estimate, rounds, started, elapsed)
    }

    /// Runs one round and returns the new estimate, queries issued and errors.
    async fn round(
        &self,
        handles: &[TxHandle],
        state: &mut PollState,
        rng: &mut ChaCha8Rng,
    ) -> (InclusionEstimate, u64, u64) {
        let tracked = handles.len() as u64;

        // Exhaustive rounds check every handle, included ones too.
        if handles.len() <= self.config.sampling_threshold {
            let queried = tracked;
            let (_, errors) = self.query(handles.to_vec(), state).await;
            let included = handles.iter().filter(|h| state.included.contains_key(*h)).count();
            return (InclusionEstimate::exact(tracked, included as u64), queried, errors);
        }

        let sample_size = self.config.sample_cap.min(handles.len());
        let sample: Vec<_> = index::sample(rng, handles.len(), sample_size)
            .into_iter()
            .map(|i| handles[i])
            .collect();

        let (known, pending): (Vec<_>, Vec<_>) =
            sample.into_iter().partition(|h| state.included.contains_key(h));
        let queried = pending.len() as u64;
        let (hits, errors) = self.query(pending, state).await;

        let verified = state.included.len() as u64;
        let estimate = InclusionEstimate::sampled(
            tracked,
            sample_size as u64,
            known.len() as u64 + hits,
            verified,
        );
        debug!(sample_size, hits, known = known.len(), verified, "sampled inclusion");
        (estimate, queried, errors)
    }

    /// Queries receipts with bounded concurrency and records inclusions.
    /// Returns the number of newly included handles and the query errors.
    ///
    /// The first observed inclusion of a handle is kept; later answers never
    /// downgrade or re-time it.
    async fn query(&self, handles: Vec<TxHandle>, state: &mut PollState) -> (u64, u64) {
        let api = &*self.api;
        let results: Vec<_> = stream::iter(handles)
            .map(|handle| async move { (handle, api.receipt(handle).await) })
            .buffer_unordered(self.config.max_concurrent_queries.max(1))
            .collect()
            .await;

        let observed_at = Instant::now();
        let mut hits = 0;
        let mut errors = 0;
        for (handle, result) in results {
            match result {
                Ok(Some(ReceiptSummary { block_number, succeeded })) => {
                    if let Entry::Vacant(entry) = state.included.entry(handle) {
                        entry.insert(InclusionRecord::included(
                            handle,
                            block_number,
                            succeeded,
                            observed_at,
                        ));
                        hits += 1;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%handle, %error, "receipt query failed");
                    errors += 1;
                }
            }
        }
        state.query_errors += errors;
        (hits, errors)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish<S: HandleSource + ?Sized>(
        &self,
        source: &S,
        mut state: PollState,
        status: PollStatus,
        estimate: InclusionEstimate,
        rounds: Vec<RoundSummary>,
        started: Instant,
        elapsed: Duration,
    ) -> InclusionReport {
        let observed_at = Instant::now();
        let records: Vec<_> = source
            .snapshot()
            .into_iter()
            .map(|handle| {
                state
                    .included
                    .remove(&handle)
                    .unwrap_or_else(|| InclusionRecord::unresolved(handle, observed_at))
            })
            .collect();

        let included: Vec<_> = records.iter().filter(|record| record.included).collect();
        let unresolved = (records.len() - included.len()) as u64;
        let reverted = included.iter().filter(|record| !record.succeeded).count() as u64;
        let heights = included.iter().filter_map(|record| record.block).collect();

        info!(
            ?status,
            tracked = records.len(),
            verified = included.len(),
            estimated = estimate.included,
            unresolved,
            reverted,
            query_errors = state.query_errors,
            "inclusion phase finished"
        );

        InclusionReport {
            status,
            estimate,
            unresolved,
            reverted,
            query_errors: state.query_errors,
            heights,
            rounds,
            started,
            elapsed,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use alloy_primitives::{Address, B256, U256};
    use async_trait::async_trait;

    use super::*;
    use crate::{
        api::BlockSummary,
        error::LedgerError,
        types::SubmissionRequest,
    };

    #[derive(Debug, Default)]
    struct MockLedger {
        receipts: HashMap<TxHandle, ReceiptSummary>,
        late: parking_lot::Mutex<HashMap<TxHandle, ReceiptSummary>>,
        failing: BTreeSet<TxHandle>,
        receipt_calls: AtomicU64,
    }

    impl MockLedger {
        fn calls(&self) -> u64 {
            self.receipt_calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl LedgerApi for MockLedger {
        async fn submit(&self, _: &SubmissionRequest) -> Result<TxHandle, LedgerError> {
            unimplemented!()
        }

        async fn sequence_number(&self, _: Address) -> Result<u64, LedgerError> {
            unimplemented!()
        }

        async fn balance(&self, _: Address) -> Result<U256, LedgerError> {
            unimplemented!()
        }

        async fn block_height(&self) -> Result<u64, LedgerError> {
            unimplemented!()
        }

        async fn block(&self, _: u64) -> Result<Option<BlockSummary>, LedgerError> {
            unimplemented!()
        }

        async fn receipt(&self, handle: TxHandle) -> Result<Option<ReceiptSummary>, LedgerError> {
            self.receipt_calls.fetch_add(1, Ordering::Relaxed);
            if self.failing.contains(&handle) {
                return Err(LedgerError::Transport("connection reset".into()));
            }
            let late = self.late.lock().get(&handle).copied();
            Ok(self.receipts.get(&handle).copied().or(late))
        }
    }

    fn handles(count: u64) -> Vec<TxHandle> {
        (0..count).map(|i| B256::from(U256::from(i))).collect()
    }

    fn ledger_including(handles: &[TxHandle], included: impl Fn(usize) -> bool) -> MockLedger {
        let receipts = handles
            .iter()
            .enumerate()
            .filter(|(i, _)| included(*i))
            .map(|(i, h)| (*h, ReceiptSummary { block_number: 1 + i as u64 % 7, succeeded: true }))
            .collect();
        MockLedger { receipts, ..Default::default() }
    }

    fn config() -> PollerConfig {
        PollerConfig::default()
            .with_poll_interval(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(5))
            .with_seed(7)
    }

    #[tokio::test(start_paused = true)]
    async fn small_sets_are_checked_exhaustively() {
        let handles = handles(50);
        let ledger = Arc::new(ledger_including(&handles, |i| i < 30));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config());

        let report = poller.await_inclusion(&handles).await;

        assert_eq!(report.status, PollStatus::TimedOut);
        assert!(report.estimate.exact);
        assert_eq!(report.estimate.included, 30);
        assert_eq!(report.unresolved, 20);
        assert_eq!(report.records.len(), 50);

        let rounds = report.rounds.len() as u64;
        assert!(rounds >= 2);
        assert!(report.rounds.iter().all(|round| round.queried == 50));
        assert_eq!(ledger.calls(), 50 * rounds);
    }

    #[tokio::test(start_paused = true)]
    async fn late_inclusions_keep_earlier_records() {
        let handles = handles(50);
        let ledger = Arc::new(ledger_including(&handles, |i| i < 25));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config());
        let late: Vec<_> = handles[25..].to_vec();

        let include_late = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let receipt = ReceiptSummary { block_number: 9, succeeded: true };
            ledger.late.lock().extend(late.iter().map(|handle| (*handle, receipt)));
        };
        let (report, ()) = tokio::join!(poller.await_inclusion(&handles), include_late);

        assert_eq!(report.status, PollStatus::Complete);
        assert_eq!(report.rounds.len(), 2);
        assert!(report.rounds.iter().all(|round| round.queried == 50));
        assert_eq!(report.rounds[0].included, 25);
        assert_eq!(report.rounds[1].included, 50);
        assert_eq!(ledger.calls(), 100);

        // Records from the first round keep their first observation.
        let first_round = report.started + Duration::from_millis(500);
        let early: Vec<_> = report.records.iter().filter(|r| r.block != Some(9)).collect();
        assert_eq!(early.len(), 25);
        assert!(early.iter().all(|r| r.observed_at < first_round));
    }

    #[tokio::test(start_paused = true)]
    async fn completes_once_everything_is_included() {
        let handles = handles(50);
        let ledger = Arc::new(ledger_including(&handles, |_| true));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config());

        let report = poller.await_inclusion(&handles).await;

        assert_eq!(report.status, PollStatus::Complete);
        assert_eq!(report.rounds.len(), 1);
        assert_eq!(report.unresolved, 0);
        assert_eq!(ledger.calls(), 50);
        assert_eq!(report.heights, (1..=7).collect::<BTreeSet<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn large_sets_are_sampled() {
        let handles = handles(100_000);
        let ledger = Arc::new(ledger_including(&handles, |i| i % 5 < 3));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config().with_sample_cap(1_000));

        let report = poller.await_inclusion(&handles).await;

        assert_eq!(report.status, PollStatus::TimedOut);
        assert!(report.rounds.iter().all(|round| round.queried <= 1_000));
        assert!(ledger.calls() <= 1_000 * report.rounds.len() as u64);

        let estimate = report.estimate;
        assert!(!estimate.exact);
        assert!(estimate.lower <= estimate.included && estimate.included <= estimate.upper);

        // 4 standard errors of a 1000-element sample at p = 0.6.
        let sigma = (0.6f64 * 0.4 / 1_000.0).sqrt() * 100_000.0;
        let error = (estimate.included as f64 - 60_000.0).abs();
        assert!(error <= 4.0 * sigma, "estimate {} too far from 60000", estimate.included);
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_stops_at_completion_threshold() {
        let handles = handles(20_000);
        let ledger = Arc::new(ledger_including(&handles, |_| true));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config());

        let report = poller.await_inclusion(&handles).await;

        assert_eq!(report.status, PollStatus::ThresholdReached);
        assert_eq!(report.rounds.len(), 1);
        assert_eq!(ledger.calls(), 1_000);
        assert_eq!(report.estimate.included, 20_000);
    }

    #[tokio::test(start_paused = true)]
    async fn query_errors_leave_handles_unresolved() {
        let handles = handles(10);
        let mut ledger = ledger_including(&handles, |_| true);
        ledger.failing = handles[..3].iter().copied().collect();
        let poller = ConfirmationPoller::new(Arc::new(ledger), config());

        let report = poller.await_inclusion(&handles).await;

        assert_eq!(report.status, PollStatus::TimedOut);
        assert_eq!(report.unresolved, 3);
        assert_eq!(report.query_errors, 3 * report.rounds.len() as u64);
        assert!(report.records.iter().filter(|r| !r.included).all(|r| r.block.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn never_polls_faster_than_the_interval() {
        let handles = handles(5);
        let ledger = Arc::new(ledger_including(&handles, |_| false));
        let poller = ConfirmationPoller::new(Arc::clone(&ledger), config());

        let report = poller.await_inclusion(&handles).await;

        for pair in report.rounds.windows(2) {
            assert!(pair[1].elapsed - pair[0].elapsed >= Duration::from_secs(1));
        }
        assert!(report.rounds.len() <= 5);
    }

    #[test]
    fn sampled_estimate_respects_known_inclusions() {
        let estimate = InclusionEstimate::sampled(10_000, 100, 0, 250);
        assert_eq!(estimate.included, 250);
        assert_eq!(estimate.lower, 250);

        let estimate = InclusionEstimate::sampled(10_000, 100, 50, 0);
        assert_eq!(estimate.included, 5_000);
        assert!(estimate.lower < 5_000 && estimate.upper > 5_000);
    }
}
