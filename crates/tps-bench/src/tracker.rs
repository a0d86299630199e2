//! Concurrent record of submission outcomes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloy_primitives::Address;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    poller::HandleSource,
    types::{FailureKind, SubmissionOutcome, TxHandle},
};

/// Default number of failure messages kept for diagnosis.
pub const DEFAULT_FAILURE_SAMPLES: usize = 5;

/// Submission counts by outcome class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    /// Every recorded outcome.
    pub total: u64,
    /// Outcomes accepted into the ledger queue.
    pub accepted: u64,
    /// Outcomes refused by the ledger.
    pub rejected: u64,
    /// Outcomes that hit their submit timeout.
    pub timed_out: u64,
    /// Outcomes that failed in transport.
    pub transport: u64,
    /// Outcomes that could not be built or signed.
    pub malformed: u64,
}

impl OutcomeCounts {
    /// Every outcome that was not accepted.
    pub const fn failed(&self) -> u64 {
        self.rejected + self.timed_out + self.transport + self.malformed
    }
}

/// Append-only store of submission outcomes.
///
/// Safe under many concurrent writers; recording never waits on readers.
#[derive(Debug)]
pub struct SubmissionTracker {
    outcomes: DashMap<u64, SubmissionOutcome>,
    accepted: DashMap<TxHandle, u64>,
    next_id: AtomicU64,
    accepted_count: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    transport: AtomicU64,
    malformed: AtomicU64,
    failure_samples: Mutex<Vec<String>>,
    sample_cap: usize,
    sealed: AtomicBool,
}

impl Default for SubmissionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_SAMPLES)
    }
}

impl SubmissionTracker {
    /// Creates a tracker keeping at most `sample_cap` failure messages.
    pub fn new(sample_cap: usize) -> Self {
        Self {
            outcomes: DashMap::new(),
            accepted: DashMap::new(),
            next_id: AtomicU64::new(0),
            accepted_count: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            transport: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            failure_samples: Mutex::new(Vec::with_capacity(sample_cap)),
            sample_cap,
            sealed: AtomicBool::new(false),
        }
    }

    /// Records an outcome.
    pub fn record(&self, outcome: SubmissionOutcome) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        match (&outcome.handle, &outcome.failure) {
            (Some(handle), _) => {
                self.accepted.insert(*handle, id);
                self.accepted_count.fetch_add(1, Ordering::Relaxed);
            }
            (None, Some(failure)) => {
                let counter = match failure.kind {
                    FailureKind::Rejected => &self.rejected,
                    FailureKind::TimedOut => &self.timed_out,
                    FailureKind::Transport => &self.transport,
                    FailureKind::Malformed => &self.malformed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                self.sample_failure(&failure.reason);
            }
            (None, None) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.outcomes.insert(id, outcome);
    }

    fn sample_failure(&self, reason: &str) {
        let mut samples = self.failure_samples.lock();
        if samples.len() < self.sample_cap {
            samples.push(reason.to_owned());
        }
    }

    /// Counts by outcome class.
    pub fn counts(&self) -> OutcomeCounts {
        let accepted = self.accepted_count.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let timed_out = self.timed_out.load(Ordering::Relaxed);
        let transport = self.transport.load(Ordering::Relaxed);
        let malformed = self.malformed.load(Ordering::Relaxed);
        OutcomeCounts {
            total: accepted + rejected + timed_out + transport + malformed,
            accepted,
            rejected,
            timed_out,
            transport,
            malformed,
        }
    }

    /// Snapshot of every accepted handle.
    pub fn accepted_handles(&self) -> Vec<TxHandle> {
        self.accepted.iter().map(|entry| *entry.key()).collect()
    }

    /// Snapshot of every outcome in recording order.
    pub fn outcomes(&self) -> Vec<SubmissionOutcome> {
        let mut outcomes: Vec<_> =
            self.outcomes.iter().map(|entry| (*entry.key(), entry.value().clone())).collect();
        outcomes.sort_unstable_by_key(|(id, _)| *id);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Outcomes of a single sender in recording order.
    pub fn outcomes_of(&self, sender: &Address) -> Vec<SubmissionOutcome> {
        self.outcomes().into_iter().filter(|outcome| outcome.request.sender == *sender).collect()
    }

    /// Sampled failure messages.
    pub fn failure_samples(&self) -> Vec<String> {
        self.failure_samples.lock().clone()
    }

    /// Marks the tracker as complete; no more outcomes will be recorded.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Returns true once [`seal`](Self::seal) was called.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

impl HandleSource for SubmissionTracker {
    fn snapshot(&self) -> Vec<TxHandle> {
        self.accepted_handles()
    }

    fn is_sealed(&self) -> bool {
        Self::is_sealed(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use alloy_primitives::{B256, U256};
    use tokio::time::Instant;

    use super::*;
    use crate::types::{MAX_REASON_LEN, SubmissionFailure, SubmissionRequest};

    fn request(nonce: u64) -> SubmissionRequest {
        SubmissionRequest {
            sender: Address::repeat_byte(1),
            recipient: Address::repeat_byte(2),
            value: U256::from(1),
            gas_limit: 21_000,
            nonce,
            gas_price: None,
        }
    }

    fn accepted(nonce: u64) -> SubmissionOutcome {
        SubmissionOutcome::accepted(
            request(nonce),
            B256::from(U256::from(nonce)),
            Instant::now(),
            Duration::ZERO,
        )
    }

    fn failed(nonce: u64, kind: FailureKind) -> SubmissionOutcome {
        SubmissionOutcome::failed(
            request(nonce),
            SubmissionFailure::new(kind, format!("failure {nonce}")),
            Instant::now(),
            Duration::ZERO,
        )
    }

    #[test]
    fn counts_by_class() {
        let tracker = SubmissionTracker::default();
        tracker.record(accepted(0));
        tracker.record(accepted(1));
        tracker.record(failed(2, FailureKind::Rejected));
        tracker.record(failed(3, FailureKind::TimedOut));
        tracker.record(failed(4, FailureKind::Transport));

        let counts = tracker.counts();
        assert_eq!(counts.total, 5);
        assert_eq!(counts.accepted, 2);
        assert_eq!(counts.rejected, 1);
        assert_eq!(counts.timed_out, 1);
        assert_eq!(counts.transport, 1);
        assert_eq!(counts.failed(), 3);
        assert_eq!(tracker.accepted_handles().len(), 2);
    }

    #[test]
    fn failure_samples_are_bounded() {
        let tracker = SubmissionTracker::new(3);
        for nonce in 0..50 {
            tracker.record(failed(nonce, FailureKind::Rejected));
        }
        assert_eq!(tracker.counts().rejected, 50);
        assert_eq!(tracker.failure_samples().len(), 3);
    }

    #[test]
    fn failure_samples_keep_the_failure_limit() {
        let tracker = SubmissionTracker::default();
        let failure = SubmissionFailure::new(FailureKind::Rejected, "x".repeat(1_000));
        tracker.record(SubmissionOutcome::failed(
            request(0),
            failure,
            Instant::now(),
            Duration::ZERO,
        ));

        let samples = tracker.failure_samples();
        assert_eq!(samples[0].len(), MAX_REASON_LEN);
    }

    #[test]
    fn outcomes_keep_recording_order() {
        let tracker = SubmissionTracker::default();
        for nonce in 0..20 {
            tracker.record(accepted(nonce));
        }
        let nonces: Vec<_> = tracker.outcomes().iter().map(|o| o.request.nonce).collect();
        assert_eq!(nonces, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_lose_nothing() {
        let tracker = Arc::new(SubmissionTracker::default());
        let writers: Vec<_> = (0..8u64)
            .map(|writer| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    for i in 0..500 {
                        let nonce = writer * 1_000 + i;
                        if i % 5 == 0 {
                            tracker.record(failed(nonce, FailureKind::Rejected));
                        } else {
                            tracker.record(accepted(nonce));
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        let counts = tracker.counts();
        assert_eq!(counts.total, 4_000);
        assert_eq!(counts.accepted, 3_200);
        assert_eq!(counts.rejected, 800);
        assert_eq!(tracker.outcomes().len(), 4_000);
    }

    #[test]
    fn seal_is_visible_through_handle_source() {
        let tracker = SubmissionTracker::default();
        assert!(!HandleSource::is_sealed(&tracker));
        tracker.seal();
        assert!(HandleSource::is_sealed(&tracker));
    }
}
