//! Ledger throughput benchmark entry point.

mod cli;

use std::{fs::File, io::BufWriter, sync::Arc, time::Duration};

use alloy_primitives::U256;
use anyhow::{Context, Result};
use clap::Parser;
use cli::{BlockTimeArgs, Cli, Command, RunArgs};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tps_bench::{
    AlloyLedgerClient, BenchmarkRunner, JsonSink, LedgerApi, RunConfig, RunReport,
    SimulatedLedger, generate_wallets, load_wallets, verify_block_time,
};
use tracing::{error, info, warn};

/// Balance given to every generated sender of a simulated run.
const SIMULATED_FUNDING: u128 = 1_000_000_000_000_000_000_000;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    cli::init_tracing(&cli.log_level, cli.log_format);

    if let Some(addr) = cli.metrics_addr {
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!(%addr, "serving prometheus metrics"),
            Err(e) => warn!(error = %e, "failed to install prometheus exporter"),
        }
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing with partial results");
                shutdown.cancel();
            }
        }
    });

    let result = match cli.command {
        Command::Run(args) => run(&args, shutdown).await,
        Command::BlockTime(args) => block_time(&args).await,
    };

    if let Err(e) = result {
        error!(error = ?e, "tps-bench failed");
        std::process::exit(1);
    }
}

async fn run(args: &RunArgs, shutdown: CancellationToken) -> Result<()> {
    let config = args.run_config();

    let report = if args.simulate {
        let signers = generate_wallets(args.simulated_senders, args.seed);
        let senders: Vec<_> = signers.iter().map(|signer| signer.address()).collect();
        let ledger = senders.iter().fold(
            SimulatedLedger::new(args.simulated_config()),
            |ledger, sender| ledger.with_account(*sender, 0, U256::from(SIMULATED_FUNDING)),
        );
        info!(senders = senders.len(), "running against simulated ledger");
        run_with(Arc::new(ledger), config.with_senders(senders), args, shutdown).await?
    } else {
        let path = args.wallets.as_deref().context("--wallets is required")?;
        let signers = load_wallets(path)
            .with_context(|| format!("failed to load wallets from {}", path.display()))?;
        let client = AlloyLedgerClient::connect(&args.rpc_url, signers).await?;
        let senders = client.senders();
        run_with(Arc::new(client), config.with_senders(senders), args, shutdown).await?
    };

    if !report.invariants_passed() {
        anyhow::bail!("invariant checks failed");
    }
    Ok(())
}

async fn run_with<L: LedgerApi + 'static>(
    api: Arc<L>,
    config: RunConfig,
    args: &RunArgs,
    shutdown: CancellationToken,
) -> Result<RunReport> {
    let runner = BenchmarkRunner::new(api, config).with_shutdown(shutdown);

    let Some(path) = &args.output else {
        return Ok(runner.run().await?);
    };
    let file = File::create(path)
        .with_context(|| format!("failed to create report file {}", path.display()))?;
    let mut sink = JsonSink::new(BufWriter::new(file));
    let report = runner.run_into(&mut sink).await?;
    info!(path = %path.display(), "report written");
    Ok(report)
}

async fn block_time(args: &BlockTimeArgs) -> Result<()> {
    let client = AlloyLedgerClient::connect(&args.rpc_url, Vec::new()).await?;
    let report = verify_block_time(
        &client,
        args.blocks,
        args.gas_per_tx,
        Duration::from_secs(args.target_secs),
    )
    .await?;
    info!(report = %serde_json::to_string(&report)?, "block time report");
    Ok(())
}
