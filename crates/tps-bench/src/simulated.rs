//! In-process ledger used by tests and dry runs.
//!
//! Blocks are produced lazily from the tokio clock: every call first catches
//! the chain up to `now`, so paused-time tests observe a deterministic history.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use alloy_primitives::{Address, U256, keccak256};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::{
    api::{BlockSummary, LedgerApi, ReceiptSummary},
    error::LedgerError,
    types::{SubmissionRequest, TxHandle},
};

/// Resource cost of a plain value transfer.
pub const TRANSFER_GAS: u64 = 21_000;

const BPS_DENOMINATOR: u32 = 10_000;

/// Behaviour of a [`SimulatedLedger`].
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Spacing between blocks.
    pub block_interval: Duration,
    /// Resource limit of every block.
    pub block_gas_limit: u64,
    /// Maximum number of pending submissions.
    pub pool_capacity: usize,
    /// Delay applied to every submit call.
    pub submit_latency: Duration,
    /// Reject every n-th submit call.
    pub reject_every: Option<u64>,
    /// Price charged per unit of resource.
    pub gas_price: u128,
    /// Fee shares in basis points; the remainder goes to the producer.
    pub fee_split: Vec<(Address, u32)>,
    /// Account credited with the unassigned fee remainder.
    pub producer: Address,
    /// Unix timestamp of block zero.
    pub genesis_timestamp: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            block_interval: Duration::from_secs(1),
            block_gas_limit: 150_000_000,
            pool_capacity: 100_000,
            submit_latency: Duration::ZERO,
            reject_every: None,
            gas_price: 2_000_000_000,
            fee_split: Vec::new(),
            producer: Address::repeat_byte(0xfe),
            genesis_timestamp: 1_700_000_000,
        }
    }
}

impl SimulatedConfig {
    /// Sets the block interval.
    pub fn with_block_interval(mut self, interval: Duration) -> Self {
        self.block_interval = interval;
        self
    }

    /// Sets the per-block resource limit.
    pub fn with_block_gas_limit(mut self, limit: u64) -> Self {
        self.block_gas_limit = limit;
        self
    }

    /// Sets the pending pool capacity.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sets the latency of every submit call.
    pub fn with_submit_latency(mut self, latency: Duration) -> Self {
        self.submit_latency = latency;
        self
    }

    /// Rejects every n-th submission.
    pub fn with_reject_every(mut self, n: u64) -> Self {
        self.reject_every = Some(n);
        self
    }

    /// Adds a fee recipient receiving `bps` basis points of every fee.
    pub fn with_fee_share(mut self, account: Address, bps: u32) -> Self {
        self.fee_split.push((account, bps));
        self
    }

    /// Sets the block producer.
    pub fn with_producer(mut self, producer: Address) -> Self {
        self.producer = producer;
        self
    }
}

/// Number of calls received per [`LedgerApi`] method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `submit` calls.
    pub submit: u64,
    /// `sequence_number` calls.
    pub sequence_number: u64,
    /// `balance` calls.
    pub balance: u64,
    /// `block_height` calls.
    pub block_height: u64,
    /// `block` calls.
    pub block: u64,
    /// `receipt` calls.
    pub receipt: u64,
}

#[derive(Debug, Default)]
struct Calls {
    submit: AtomicU64,
    sequence_number: AtomicU64,
    balance: AtomicU64,
    block_height: AtomicU64,
    block: AtomicU64,
    receipt: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

#[derive(Debug, Clone, Default)]
struct Account {
    nonce: u64,
    balance: U256,
}

#[derive(Debug, Clone)]
struct PendingTx {
    handle: TxHandle,
    recipient: Address,
    value: U256,
}

#[derive(Debug)]
struct ChainState {
    genesis: Instant,
    accounts: HashMap<Address, Account>,
    pool: BTreeMap<Address, BTreeMap<u64, PendingTx>>,
    pooled: usize,
    blocks: Vec<BlockSummary>,
    receipts: HashMap<TxHandle, ReceiptSummary>,
}

/// A [`LedgerApi`] backed by an in-memory chain.
#[derive(Debug)]
pub struct SimulatedLedger {
    config: SimulatedConfig,
    state: Mutex<ChainState>,
    calls: Calls,
}

impl SimulatedLedger {
    /// Creates a chain whose genesis block is produced now.
    pub fn new(config: SimulatedConfig) -> Self {
        let genesis = BlockSummary {
            number: 0,
            timestamp: config.genesis_timestamp,
            transaction_count: 0,
            gas_used: 0,
            gas_limit: config.block_gas_limit,
        };
        let state = ChainState {
            genesis: Instant::now(),
            accounts: HashMap::new(),
            pool: BTreeMap::new(),
            pooled: 0,
            blocks: vec![genesis],
            receipts: HashMap::new(),
        };
        Self { config, state: Mutex::new(state), calls: Calls::default() }
    }

    /// Sets the nonce and balance of `account`.
    pub fn with_account(self, account: Address, nonce: u64, balance: U256) -> Self {
        self.state.lock().accounts.insert(account, Account { nonce, balance });
        self
    }

    /// Calls received so far.
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            submit: self.calls.submit.load(Ordering::Relaxed),
            sequence_number: self.calls.sequence_number.load(Ordering::Relaxed),
            balance: self.calls.balance.load(Ordering::Relaxed),
            block_height: self.calls.block_height.load(Ordering::Relaxed),
            block: self.calls.block.load(Ordering::Relaxed),
            receipt: self.calls.receipt.load(Ordering::Relaxed),
        }
    }

    /// Largest number of submit calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> u64 {
        self.calls.peak_in_flight.load(Ordering::Relaxed)
    }

    /// Number of submissions waiting for inclusion.
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        state.pooled
    }

    /// Number of included submissions.
    pub fn included(&self) -> usize {
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        state.receipts.len()
    }

    fn catch_up(&self, state: &mut ChainState) {
        let interval = self.config.block_interval.as_nanos().max(1);
        let target = (Instant::now().duration_since(state.genesis).as_nanos() / interval) as u64;
        while (state.blocks.len() as u64) <= target {
            self.produce(state);
        }
    }

    fn produce(&self, state: &mut ChainState) {
        let number = state.blocks.len() as u64;
        let interval_ms = self.config.block_interval.as_millis() as u64;
        let timestamp = self.config.genesis_timestamp + number * interval_ms / 1_000;
        let fee = U256::from(TRANSFER_GAS) * U256::from(self.config.gas_price);

        let mut gas_used = 0u64;
        let mut transaction_count = 0u64;

        // One transaction per sender per pass keeps senders interleaved.
        loop {
            let mut progressed = false;
            for (sender, queue) in state.pool.iter_mut() {
                if gas_used + TRANSFER_GAS > self.config.block_gas_limit {
                    break;
                }
                let account = state.accounts.entry(*sender).or_default();
                let Some(tx) = queue.remove(&account.nonce) else { continue };

                account.nonce += 1;
                let succeeded = account.balance >= tx.value + fee;
                if succeeded {
                    account.balance -= tx.value + fee;
                } else {
                    account.balance = account.balance.saturating_sub(fee);
                }

                if succeeded {
                    state.accounts.entry(tx.recipient).or_default().balance += tx.value;
                }
                let mut distributed = U256::ZERO;
                for (recipient, bps) in &self.config.fee_split {
                    let share = fee * U256::from(*bps) / U256::from(BPS_DENOMINATOR);
                    state.accounts.entry(*recipient).or_default().balance += share;
                    distributed += share;
                }
                state.accounts.entry(self.config.producer).or_default().balance +=
                    fee.saturating_sub(distributed);

                let receipt = ReceiptSummary { block_number: number, succeeded };
                state.receipts.insert(tx.handle, receipt);
                state.pooled -= 1;
                gas_used += TRANSFER_GAS;
                transaction_count += 1;
                progressed = true;
            }
            if !progressed || gas_used + TRANSFER_GAS > self.config.block_gas_limit {
                break;
            }
        }
        state.pool.retain(|_, queue| !queue.is_empty());

        trace!(number, transaction_count, "simulated block produced");
        state.blocks.push(BlockSummary {
            number,
            timestamp,
            transaction_count,
            gas_used,
            gas_limit: self.config.block_gas_limit,
        });
    }

    fn admit(&self, request: &SubmissionRequest) -> Result<TxHandle, LedgerError> {
        let submitted = self.calls.submit.load(Ordering::Relaxed);
        if self.config.reject_every.is_some_and(|n| n > 0 && submitted % n == 0) {
            return Err(LedgerError::Rejected("simulated rejection".into()));
        }
        if request.gas_limit < TRANSFER_GAS {
            return Err(LedgerError::Rejected("intrinsic gas too low".into()));
        }

        let mut state = self.state.lock();
        self.catch_up(&mut state);

        let expected = state.accounts.get(&request.sender).map_or(0, |account| account.nonce);
        if request.nonce < expected {
            return Err(LedgerError::Rejected("nonce too low".into()));
        }
        if state.pool.get(&request.sender).is_some_and(|queue| queue.contains_key(&request.nonce)) {
            return Err(LedgerError::Rejected("already known".into()));
        }
        if state.pooled >= self.config.pool_capacity {
            return Err(LedgerError::Rejected("txpool is full".into()));
        }

        let handle =
            keccak256([request.sender.as_slice(), &request.nonce.to_be_bytes()[..]].concat());
        state.pool.entry(request.sender).or_default().insert(
            request.nonce,
            PendingTx { handle, recipient: request.recipient, value: request.value },
        );
        state.pooled += 1;
        Ok(handle)
    }
}

#[async_trait]
impl LedgerApi for SimulatedLedger {
    async fn submit(&self, request: &SubmissionRequest) -> Result<TxHandle, LedgerError> {
        self.calls.submit.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.calls.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.calls.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);

        if !self.config.submit_latency.is_zero() {
            tokio::time::sleep(self.config.submit_latency).await;
        }
        let result = self.admit(request);

        self.calls.in_flight.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn sequence_number(&self, account: Address) -> Result<u64, LedgerError> {
        self.calls.sequence_number.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        Ok(state.accounts.get(&account).map_or(0, |account| account.nonce))
    }

    async fn balance(&self, account: Address) -> Result<U256, LedgerError> {
        self.calls.balance.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        Ok(state.accounts.get(&account).map_or(U256::ZERO, |account| account.balance))
    }

    async fn block_height(&self) -> Result<u64, LedgerError> {
        self.calls.block_height.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        Ok(state.blocks.len() as u64 - 1)
    }

    async fn block(&self, height: u64) -> Result<Option<BlockSummary>, LedgerError> {
        self.calls.block.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        Ok(usize::try_from(height).ok().and_then(|index| state.blocks.get(index).copied()))
    }

    async fn receipt(&self, handle: TxHandle) -> Result<Option<ReceiptSummary>, LedgerError> {
        self.calls.receipt.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        self.catch_up(&mut state);
        Ok(state.receipts.get(&handle).copied())
    }
}
