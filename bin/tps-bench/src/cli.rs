//! CLI argument parsing and configuration.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use alloy_primitives::{Address, U256};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tps_bench::{
    InvariantCheck, PollerConfig, RecipientPolicy, RefillEstimate, RunConfig, SaturationConfig,
    SimulatedConfig, Strategy, TransferTemplate,
};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Throughput benchmarking and verification for EVM ledgers.
#[derive(Parser, Debug)]
#[command(name = "tps-bench", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Default log filter, overridden by `RUST_LOG`.
    #[arg(long, env = "TPS_BENCH_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log line format.
    #[arg(long, env = "TPS_BENCH_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "TPS_BENCH_METRICS_ADDR", global = true)]
    pub metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Generate load, track inclusion and verify invariants.
    Run(Box<RunArgs>),
    /// Analyse the cadence and capacity of recent blocks.
    BlockTime(BlockTimeArgs),
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Initializes the global tracing subscriber.
pub(crate) fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

#[derive(Args, Debug)]
pub(crate) struct RunArgs {
    /// JSON-RPC endpoint of the ledger.
    #[arg(long, env = "TPS_BENCH_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: String,

    /// JSON file holding the sender private keys.
    #[arg(long, env = "TPS_BENCH_WALLETS", required_unless_present = "simulate")]
    pub wallets: Option<PathBuf>,

    /// Run against an in-process simulated ledger instead of `rpc_url`.
    #[arg(long)]
    pub simulate: bool,

    /// Senders generated for a simulated run.
    #[arg(long, default_value = "10")]
    pub simulated_senders: usize,

    /// Block spacing of the simulated ledger in milliseconds.
    #[arg(long, default_value = "1000")]
    pub simulated_block_ms: u64,

    /// Load strategy.
    #[arg(long, default_value = "steady-batch")]
    pub strategy: StrategyKind,

    /// Requests to generate.
    #[arg(long, default_value = "100")]
    pub target_count: u64,

    /// Requests per group of the steady-batch strategy.
    #[arg(long, default_value = "5")]
    pub batch_size: usize,

    /// Pause between groups in milliseconds.
    #[arg(long, default_value = "200")]
    pub batch_pause_ms: u64,

    /// Send phase length in seconds; required by the saturation strategy.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Requests pushed before saturation starts refilling.
    #[arg(long, default_value = "8000")]
    pub initial_fill: u64,

    /// Requests awaited together while filling.
    #[arg(long, default_value = "100")]
    pub fill_chunk: usize,

    /// Refill spacing in milliseconds.
    #[arg(long, default_value = "1000")]
    pub refill_interval_ms: u64,

    /// Upper bound on a single refill.
    #[arg(long, default_value = "4000")]
    pub refill_cap: u64,

    /// How saturation estimates the requests consumed since the last refill.
    #[arg(long, default_value = "block-progress")]
    pub refill_estimate: RefillEstimateKind,

    /// Requests assumed consumed per block by the `block-progress` estimate.
    #[arg(long, default_value = "1000")]
    pub assumed_per_block: u64,

    /// Value of each transfer in wei.
    #[arg(long, default_value = "1000000000000000")]
    pub value_wei: U256,

    /// Gas limit attached to each transfer.
    #[arg(long, env = "TPS_BENCH_GAS_LIMIT", default_value = "21000")]
    pub gas_limit: u64,

    /// Resource cost of one transaction, used for capacity figures.
    #[arg(long, env = "TPS_BENCH_GAS_PER_TX", default_value = "21000")]
    pub gas_per_tx: u64,

    /// Gas price in wei; read from the node when unset.
    #[arg(long)]
    pub gas_price: Option<u128>,

    /// Transfer recipient: `next-sender`, `self` or an address.
    #[arg(long, default_value = "next-sender")]
    pub recipient: RecipientArg,

    /// Bound on each submit call in seconds.
    #[arg(long, default_value = "10")]
    pub submit_timeout_secs: u64,

    /// Hard bound on the send phase in seconds.
    #[arg(long)]
    pub send_timeout_secs: Option<u64>,

    /// Spacing of inclusion poll rounds in milliseconds.
    #[arg(long, default_value = "2000")]
    pub poll_interval_ms: u64,

    /// Inclusion phase bound in seconds.
    #[arg(long, default_value = "120")]
    pub inclusion_timeout_secs: u64,

    /// Included fraction at which a sampled poll completes.
    #[arg(long, default_value = "0.95")]
    pub completion_threshold: f64,

    /// Largest handle set checked exhaustively.
    #[arg(long, default_value = "10000")]
    pub sampling_threshold: usize,

    /// Handles checked per sampled round.
    #[arg(long, default_value = "1000")]
    pub sample_cap: usize,

    /// Seed for sampling and simulated wallets.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Account expected to gain balance. Repeatable.
    #[arg(long = "expect-positive", value_name = "ADDR")]
    pub expect_positive: Vec<Address>,

    /// Expected delta ratio of two accounts. Repeatable.
    #[arg(long = "expect-ratio", value_name = "NUM/DEN=TARGET")]
    pub expect_ratio: Vec<RatioArg>,

    /// Relative tolerance of ratio checks.
    #[arg(long, default_value = "0.1")]
    pub ratio_tolerance: f64,

    /// Gas limit per block; read from blocks when unset.
    #[arg(long)]
    pub gas_limit_per_block: Option<u64>,

    /// Most recent blocks of the run window analysed.
    #[arg(long, default_value = "100")]
    pub max_blocks: u64,

    /// Write the report as JSON to this file.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    /// Builds the library configuration; senders are filled in by the caller.
    pub(crate) fn run_config(&self) -> RunConfig {
        let strategy = match self.strategy {
            StrategyKind::Burst => Strategy::Burst,
            StrategyKind::SteadyBatch => Strategy::SteadyBatch {
                batch_size: self.batch_size,
                pause: (self.batch_pause_ms > 0)
                    .then(|| Duration::from_millis(self.batch_pause_ms)),
            },
            StrategyKind::Saturation => Strategy::Saturation(SaturationConfig {
                initial_fill: self.initial_fill,
                fill_chunk: self.fill_chunk,
                refill_interval: Duration::from_millis(self.refill_interval_ms),
                refill_cap: self.refill_cap,
                estimate: match self.refill_estimate {
                    RefillEstimateKind::BlockProgress => RefillEstimate::BlockProgress {
                        assumed_per_block: self.assumed_per_block,
                    },
                    RefillEstimateKind::BlockContent => RefillEstimate::BlockContent,
                },
            }),
        };

        let mut poller = PollerConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_timeout(Duration::from_secs(self.inclusion_timeout_secs))
            .with_completion_threshold(self.completion_threshold)
            .with_sampling_threshold(self.sampling_threshold)
            .with_sample_cap(self.sample_cap);
        if let Some(seed) = self.seed {
            poller = poller.with_seed(seed);
        }

        let mut config = RunConfig::default()
            .with_strategy(strategy)
            .with_target_count(self.target_count)
            .with_transfer(TransferTemplate {
                value: self.value_wei,
                gas_limit: self.gas_limit,
                gas_price: self.gas_price,
                recipients: self.recipient.0,
            })
            .with_gas_per_tx(self.gas_per_tx)
            .with_submit_timeout(Duration::from_secs(self.submit_timeout_secs))
            .with_poller(poller)
            .with_max_blocks_analyzed(self.max_blocks);

        if let Some(secs) = self.duration_secs {
            config = config.with_duration(Duration::from_secs(secs));
        }
        if let Some(secs) = self.send_timeout_secs {
            config = config.with_send_timeout(Duration::from_secs(secs));
        }
        if let Some(limit) = self.gas_limit_per_block {
            config = config.with_gas_limit_per_block(limit);
        }
        for account in &self.expect_positive {
            config = config.with_invariant(InvariantCheck::positive(
                format!("{account} receives fees"),
                *account,
            ));
        }
        for ratio in &self.expect_ratio {
            config = config.with_invariant(
                InvariantCheck::ratio(
                    format!("{}/{} = {}", ratio.numerator, ratio.denominator, ratio.target),
                    ratio.numerator,
                    ratio.denominator,
                    ratio.target,
                )
                .with_tolerance(self.ratio_tolerance),
            );
        }
        config
    }

    /// Configuration of the simulated ledger.
    pub(crate) fn simulated_config(&self) -> SimulatedConfig {
        SimulatedConfig::default()
            .with_block_interval(Duration::from_millis(self.simulated_block_ms.max(1)))
    }
}

#[derive(Args, Debug)]
pub(crate) struct BlockTimeArgs {
    /// JSON-RPC endpoint of the ledger.
    #[arg(long, env = "TPS_BENCH_RPC_URL", default_value = "http://localhost:8545")]
    pub rpc_url: String,

    /// Block intervals analysed.
    #[arg(long, default_value = "100")]
    pub blocks: u64,

    /// Expected block spacing in seconds.
    #[arg(long, default_value = "1")]
    pub target_secs: u64,

    /// Resource cost of one transaction.
    #[arg(long, env = "TPS_BENCH_GAS_PER_TX", default_value = "21000")]
    pub gas_per_tx: u64,
}

/// Load strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum StrategyKind {
    /// Everything at once.
    Burst,
    /// Fixed-size groups.
    SteadyBatch,
    /// Keep the queue full for the whole duration.
    Saturation,
}

/// Saturation refill estimate selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum RefillEstimateKind {
    /// New blocks times `--assumed-per-block`.
    BlockProgress,
    /// Transactions counted in new blocks.
    BlockContent,
}

/// Parsed `--recipient` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecipientArg(pub RecipientPolicy);

impl FromStr for RecipientArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next-sender" => Ok(Self(RecipientPolicy::NextSender)),
            "self" => Ok(Self(RecipientPolicy::SelfTransfer)),
            other => other
                .parse()
                .map(|address| Self(RecipientPolicy::Fixed(address)))
                .map_err(|e| format!("invalid recipient {other}: {e}")),
        }
    }
}

/// Parsed `--expect-ratio NUM/DEN=TARGET` value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RatioArg {
    pub numerator: Address,
    pub denominator: Address,
    pub target: f64,
}

impl FromStr for RatioArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (accounts, target) =
            s.split_once('=').ok_or_else(|| format!("expected NUM/DEN=TARGET, got {s}"))?;
        let (numerator, denominator) = accounts
            .split_once('/')
            .ok_or_else(|| format!("expected NUM/DEN=TARGET, got {s}"))?;

        let address = |value: &str| {
            Address::from_str(value.trim()).map_err(|e| format!("invalid address {value}: {e}"))
        };
        let target: f64 =
            target.trim().parse().map_err(|e| format!("invalid target {target}: {e}"))?;
        if !(target > 0.0 && target.is_finite()) {
            return Err(format!("ratio target must be positive, got {target}"));
        }

        Ok(Self { numerator: address(numerator)?, denominator: address(denominator)?, target })
    }
}
