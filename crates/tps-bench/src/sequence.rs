//! Per-sender sequence number allocation.

use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use alloy_primitives::Address;
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

use crate::{api::LedgerApi, error::SetupError};

/// Atomic sequence counter of a single sender.
#[derive(Debug)]
pub struct SequenceCounter {
    start: u64,
    next: AtomicU64,
}

impl SequenceCounter {
    const fn new(start: u64) -> Self {
        Self { start, next: AtomicU64::new(start) }
    }

    /// Returns the next unused sequence number.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserves `count` consecutive sequence numbers.
    pub fn reserve(&self, count: u64) -> Range<u64> {
        let first = self.next.fetch_add(count, Ordering::SeqCst);
        first..first + count
    }

    /// The value the counter was seeded with.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// How many sequence numbers were handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - self.start
    }
}

/// Span of sequence numbers allocated to a sender during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SequenceSpan {
    /// The sender.
    pub sender: Address,
    /// First sequence number of the run.
    pub start: u64,
    /// Number of sequence numbers handed out.
    pub issued: u64,
}

/// Hands out strictly increasing sequence numbers per sender.
///
/// Every counter is seeded from a single authoritative read before any
/// submission and is never re-read, so concurrent callers can never observe
/// the same value twice.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    counters: HashMap<Address, Arc<SequenceCounter>>,
}

impl SequenceAllocator {
    /// Reads the current sequence number of every sender concurrently.
    pub async fn seed<L: LedgerApi + ?Sized>(
        api: &L,
        senders: &[Address],
    ) -> Result<Self, SetupError> {
        let reads = senders.iter().map(|&account| async move {
            api.sequence_number(account)
                .await
                .map(|start| (account, start))
                .map_err(|source| SetupError::SequenceSeed { account, source })
        });
        let starts = try_join_all(reads).await?;

        for (sender, start) in &starts {
            debug!(%sender, start, "seeded sequence counter");
        }
        info!(senders = starts.len(), "sequence numbers seeded");

        Ok(Self::from_starts(starts))
    }

    /// Builds an allocator from known starting values.
    pub fn from_starts(starts: impl IntoIterator<Item = (Address, u64)>) -> Self {
        let counters = starts
            .into_iter()
            .map(|(sender, start)| (sender, Arc::new(SequenceCounter::new(start))))
            .collect();
        Self { counters }
    }

    /// Returns the next sequence number of `sender`, or `None` if it was never seeded.
    pub fn next(&self, sender: &Address) -> Option<u64> {
        self.counters.get(sender).map(|counter| counter.next())
    }

    /// Reserves `count` consecutive sequence numbers for `sender`.
    pub fn reserve(&self, sender: &Address, count: u64) -> Option<Range<u64>> {
        self.counters.get(sender).map(|counter| counter.reserve(count))
    }

    /// First sequence number of `sender` in this run.
    pub fn start(&self, sender: &Address) -> Option<u64> {
        self.counters.get(sender).map(|counter| counter.start())
    }

    /// Sequence numbers handed out for `sender` so far.
    pub fn issued(&self, sender: &Address) -> Option<u64> {
        self.counters.get(sender).map(|counter| counter.issued())
    }

    /// Shared handle to the counter of `sender`.
    pub fn counter(&self, sender: &Address) -> Option<Arc<SequenceCounter>> {
        self.counters.get(sender).cloned()
    }

    /// Seeded senders in ascending address order.
    pub fn senders(&self) -> Vec<Address> {
        let mut senders: Vec<_> = self.counters.keys().copied().collect();
        senders.sort();
        senders
    }

    /// Allocated spans in ascending sender order.
    pub fn spans(&self) -> Vec<SequenceSpan> {
        self.senders()
            .into_iter()
            .filter_map(|sender| {
                self.counters.get(&sender).map(|counter| SequenceSpan {
                    sender,
                    start: counter.start(),
                    issued: counter.issued(),
                })
            })
            .collect()
    }

    /// Number of seeded senders.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns true if no sender was seeded.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::simulated::{SimulatedConfig, SimulatedLedger};

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_next_calls_never_collide() {
        let sender = Address::repeat_byte(0x11);
        let allocator = Arc::new(SequenceAllocator::from_starts([(sender, 42)]));

        let tasks: Vec<_> = (0..10_000)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                tokio::spawn(async move { allocator.next(&sender).unwrap() })
            })
            .collect();

        let mut issued = Vec::with_capacity(tasks.len());
        for task in tasks {
            issued.push(task.await.unwrap());
        }

        let unique: BTreeSet<_> = issued.iter().copied().collect();
        assert_eq!(unique.len(), 10_000);
        assert_eq!(unique, (42..42 + 10_000).collect::<BTreeSet<_>>());
        assert_eq!(allocator.spans()[0].issued, 10_000);
    }

    #[test]
    fn concurrent_reservations_are_disjoint() {
        let sender = Address::repeat_byte(0x22);
        let allocator = SequenceAllocator::from_starts([(sender, 0)]);

        let ranges: Vec<Range<u64>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| allocator.reserve(&sender, 25).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let all: BTreeSet<u64> = ranges.into_iter().flatten().collect();
        assert_eq!(all, (0..400).collect::<BTreeSet<_>>());
    }

    #[test]
    fn unseeded_sender_gets_nothing() {
        let allocator = SequenceAllocator::from_starts([(Address::repeat_byte(1), 5)]);
        assert_eq!(allocator.next(&Address::repeat_byte(2)), None);
        assert_eq!(allocator.next(&Address::repeat_byte(1)), Some(5));
        assert_eq!(allocator.next(&Address::repeat_byte(1)), Some(6));
        assert_eq!(allocator.start(&Address::repeat_byte(1)), Some(5));
        assert_eq!(allocator.issued(&Address::repeat_byte(1)), Some(2));
        assert_eq!(allocator.issued(&Address::repeat_byte(2)), None);
    }

    #[tokio::test]
    async fn seeds_from_ledger_once() {
        let alice = Address::repeat_byte(0xa1);
        let bob = Address::repeat_byte(0xb0);
        let ledger = SimulatedLedger::new(SimulatedConfig::default())
            .with_account(alice, 7, Default::default())
            .with_account(bob, 0, Default::default());

        let allocator = SequenceAllocator::seed(&ledger, &[alice, bob]).await.unwrap();
        for _ in 0..3 {
            allocator.next(&alice);
        }

        assert_eq!(ledger.calls().sequence_number, 2);
        assert_eq!(allocator.next(&alice), Some(10));
        assert_eq!(allocator.next(&bob), Some(0));
    }
}
