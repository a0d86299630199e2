#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod aggregator;
pub use aggregator::{
    AggregateInput, BlockRate, CadenceStats, LatencyStats, Measurement, ThroughputMetrics,
    aggregate, block_cadence, theoretical_capacity,
};

mod api;
pub use api::{BlockSummary, LedgerApi, ReceiptSummary};

mod blocktime;
pub use blocktime::{BlockTimeReport, verify_block_time};

mod client;
pub use client::AlloyLedgerClient;

mod error;
pub use error::{LedgerError, RunError, SetupError, SinkError};

mod generator;
pub use generator::{
    BacklogEstimator, BlockContentEstimator, BlockProgressEstimator, LoadGenerator,
    RecipientPolicy, RefillEstimate, SaturationConfig, SendPhase, Strategy, TransferTemplate,
};

mod invariant;
pub use invariant::{
    BalanceDelta, CheckResult, DEFAULT_TOLERANCE, Expectation, InvariantCheck,
    InvariantVerifier, take_snapshots, take_snapshots_partial,
};

mod metrics;

mod poller;
pub use poller::{
    ConfirmationPoller, HandleSource, InclusionEstimate, InclusionReport, PollStatus,
    PollerConfig, RoundSummary,
};

mod report;
pub use report::{BalanceReport, ConfigEcho, InclusionSummary, RunReport, SendSummary};

mod runner;
pub use runner::{BenchmarkRunner, RunConfig};

mod sequence;
pub use sequence::{SequenceAllocator, SequenceCounter, SequenceSpan};

mod simulated;
pub use simulated::{CallCounts, SimulatedConfig, SimulatedLedger, TRANSFER_GAS};

mod sink;
pub use sink::{JsonSink, ResultSink};

mod tracker;
pub use tracker::{DEFAULT_FAILURE_SAMPLES, OutcomeCounts, SubmissionTracker};

mod types;
pub use types::{
    BalanceSnapshot, FailureKind, InclusionRecord, RunWindow, SubmissionFailure,
    SubmissionOutcome, SubmissionRequest, TxHandle,
};

mod wallet;
pub use wallet::{WalletError, generate_wallets, load_wallets};
