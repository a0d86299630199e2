//! End-to-end runs against the simulated ledger.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{Address, U256};
use tokio_util::sync::CancellationToken;
use tps_bench::{
    BenchmarkRunner, InvariantCheck, JsonSink, LedgerApi, PollStatus, PollerConfig,
    RefillEstimate, RunConfig, RunReport, SaturationConfig, SetupError, SimulatedConfig,
    SimulatedLedger, Strategy,
};

const ECOSYSTEM: Address = Address::repeat_byte(0xe0);
const RESERVE: Address = Address::repeat_byte(0xe1);

fn senders(count: u8) -> Vec<Address> {
    (1..=count).map(Address::repeat_byte).collect()
}

fn funded(config: SimulatedConfig, senders: &[Address]) -> Arc<SimulatedLedger> {
    let funding = U256::from(10).pow(U256::from(21));
    let ledger = senders
        .iter()
        .fold(SimulatedLedger::new(config), |ledger, sender| {
            ledger.with_account(*sender, 0, funding)
        });
    Arc::new(ledger)
}

fn fee_split(ecosystem_bps: u32, reserve_bps: u32) -> SimulatedConfig {
    SimulatedConfig::default()
        .with_fee_share(ECOSYSTEM, ecosystem_bps)
        .with_fee_share(RESERVE, reserve_bps)
}

#[tokio::test(start_paused = true)]
async fn steady_batch_run_includes_everything() {
    let senders = senders(10);
    let ledger = funded(
        SimulatedConfig::default().with_submit_latency(Duration::from_millis(10)),
        &senders,
    );
    let config = RunConfig::default()
        .with_senders(senders.clone())
        .with_target_count(100)
        .with_strategy(Strategy::SteadyBatch {
            batch_size: 5,
            pause: Some(Duration::from_millis(200)),
        });

    let mut sink: Vec<RunReport> = Vec::new();
    let report = BenchmarkRunner::new(Arc::clone(&ledger), config)
        .run_into(&mut sink)
        .await
        .unwrap();

    assert_eq!(report.sent(), 100);
    assert_eq!(report.included(), 100);
    assert_eq!(report.inclusion.status, PollStatus::Complete);
    assert_eq!(report.inclusion.unresolved, 0);
    assert_eq!(report.send.groups, 20);
    assert!(report.metrics.send_rate.value().unwrap() > 0.0);
    assert!(report.metrics.inclusion_rate.value().unwrap() > 0.0);
    assert!(!report.metrics.send_rate_authoritative);
    assert!(report.metrics.theoretical_capacity.is_defined());
    assert_eq!(report.metrics.success_rate.value(), Some(1.0));
    assert_eq!(report.metrics.submit_latency.samples, 100);
    assert!(report.metrics.submit_latency.min_secs.value().unwrap() >= 0.01);
    assert_eq!(report.metrics.inclusion_latency.samples, 100);
    assert!(report.metrics.inclusion_latency.p99_secs.is_defined());
    assert_eq!(ledger.peak_in_flight(), 5);
    assert_eq!(sink, vec![report.clone()]);

    // The ledger only includes gap-free nonce sequences.
    assert_eq!(ledger.included(), 100);
    for span in &report.sequences {
        assert_eq!((span.start, span.issued), (0, 10));
        assert_eq!(ledger.sequence_number(span.sender).await.unwrap(), 10);
    }
}

#[tokio::test(start_paused = true)]
async fn send_timeout_cuts_long_pauses() {
    let senders = senders(5);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_target_count(100)
        .with_strategy(Strategy::SteadyBatch {
            batch_size: 5,
            pause: Some(Duration::from_secs(60)),
        })
        .with_send_timeout(Duration::from_secs(10));

    let report = BenchmarkRunner::new(ledger, config).run().await.unwrap();

    assert!(report.send.stopped_early);
    assert_eq!(report.send.groups, 1);
    assert_eq!(report.send.accepted, 5);
    assert!(report.send.duration_secs <= 10.5);
    assert!(report.metrics.send_rate.value().unwrap() > 0.45);
}

#[tokio::test(start_paused = true)]
async fn empty_burst_only_touches_setup() {
    let senders = senders(3);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(0);

    let report = BenchmarkRunner::new(Arc::clone(&ledger), config).run().await.unwrap();

    let calls = ledger.calls();
    assert_eq!(calls.submit, 0);
    assert_eq!(calls.receipt, 0);
    assert_eq!(calls.sequence_number, 3);
    assert_eq!(report.sent(), 0);
    assert_eq!(report.inclusion.status, PollStatus::Complete);
    assert!(!report.metrics.send_rate.is_defined());
}

#[tokio::test(start_paused = true)]
async fn burst_run_is_complete() {
    let senders = senders(4);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(40);

    let report = BenchmarkRunner::new(Arc::clone(&ledger), config).run().await.unwrap();

    assert_eq!(report.send.groups, 1);
    assert_eq!(report.sent(), 40);
    assert_eq!(report.included(), 40);
    assert_eq!(ledger.calls().submit, 40);
}

#[tokio::test(start_paused = true)]
async fn large_runs_are_sampled() {
    let senders = senders(10);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let poller = PollerConfig::default()
        .with_sampling_threshold(20)
        .with_sample_cap(10)
        .with_seed(42);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(100)
        .with_poller(poller);

    let report = BenchmarkRunner::new(Arc::clone(&ledger), config).run().await.unwrap();

    let estimate = report.inclusion.estimate;
    assert_eq!(report.inclusion.status, PollStatus::ThresholdReached);
    assert!(!estimate.exact);
    assert_eq!(estimate.sample_size, 10);
    assert_eq!(estimate.included, 100);
    assert!(estimate.lower <= estimate.included && estimate.included <= estimate.upper);
    assert_eq!(report.inclusion.verified, 10);
    assert!(ledger.calls().receipt <= 20);
}

#[tokio::test(start_paused = true)]
async fn no_blocks_leave_rates_undefined() {
    let senders = senders(2);
    let ledger = funded(
        SimulatedConfig::default().with_block_interval(Duration::from_secs(3_600)),
        &senders,
    );
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(10)
        .with_poller(PollerConfig::default().with_timeout(Duration::from_secs(5)));

    let report = BenchmarkRunner::new(Arc::clone(&ledger), config).run().await.unwrap();

    assert_eq!(report.inclusion.status, PollStatus::TimedOut);
    assert_eq!(report.inclusion.unresolved, 10);
    assert_eq!(report.metrics.blocks_produced, Some(0));
    assert!(report.blocks.is_empty());
    assert!(!report.metrics.inclusion_rate.is_defined());
    assert!(!report.metrics.theoretical_capacity.is_defined());
    assert!(!report.metrics.utilization.is_defined());
    assert!(report.metrics.block_cadence.is_none());

    assert_eq!(report.metrics.success_rate.value(), Some(0.0));
    assert_eq!(report.metrics.inclusion_latency.samples, 0);

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["metrics"]["inclusion_rate"].is_null());
    assert!(json["metrics"]["inclusion_latency"]["mean_secs"].is_null());
}

#[tokio::test(start_paused = true)]
async fn fee_split_ratio_holds() {
    let senders = senders(5);
    let ledger = funded(fee_split(2_000, 1_000), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(50)
        .with_invariant(InvariantCheck::positive("ecosystem receives fees", ECOSYSTEM))
        .with_invariant(InvariantCheck::ratio("ecosystem / reserve", ECOSYSTEM, RESERVE, 2.0));

    let report = BenchmarkRunner::new(ledger, config).run().await.unwrap();

    assert!(report.invariants_passed());
    assert_eq!(report.invariants[1].observed, Some(2.0));
    assert_eq!(report.balances.before.len(), 2);
    assert_eq!(report.balances.after.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn fee_split_ratio_violation_is_reported() {
    let senders = senders(5);
    let ledger = funded(fee_split(2_000, 500), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(50)
        .with_invariant(InvariantCheck::ratio("ecosystem / reserve", ECOSYSTEM, RESERVE, 2.0));

    let report = BenchmarkRunner::new(ledger, config).run().await.unwrap();

    assert!(!report.invariants_passed());
    assert_eq!(report.invariants[0].observed, Some(4.0));
}

#[tokio::test(start_paused = true)]
async fn saturation_polls_while_sending() {
    let senders = senders(10);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let saturation = SaturationConfig {
        initial_fill: 50,
        fill_chunk: 10,
        refill_interval: Duration::from_secs(1),
        refill_cap: 100,
        estimate: RefillEstimate::BlockContent,
    };
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Saturation(saturation))
        .with_target_count(200)
        .with_duration(Duration::from_secs(20));

    let report = BenchmarkRunner::new(Arc::clone(&ledger), config).run().await.unwrap();

    assert_eq!(report.send.dispatched, 200);
    assert_eq!(report.sent(), 200);
    assert_eq!(report.included(), 200);
    assert_eq!(report.inclusion.status, PollStatus::Complete);
    assert!(report.send.groups > 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_reports_partial_results() {
    let senders = senders(2);
    let ledger = funded(
        SimulatedConfig::default().with_block_interval(Duration::from_secs(3_600)),
        &senders,
    );
    let shutdown = CancellationToken::new();
    let config = RunConfig::default().with_senders(senders).with_target_count(10);

    shutdown.cancel();
    let report = BenchmarkRunner::new(ledger, config).with_shutdown(shutdown).run().await.unwrap();

    assert!(report.send.stopped_early);
    assert_eq!(report.inclusion.status, PollStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_fails_before_any_call() {
    let ledger = Arc::new(SimulatedLedger::new(SimulatedConfig::default()));

    let error = BenchmarkRunner::new(Arc::clone(&ledger), RunConfig::default())
        .run()
        .await
        .unwrap_err();

    assert!(matches!(error, SetupError::InvalidConfig(_)));
    assert_eq!(ledger.calls().block_height, 0);
}

#[tokio::test(start_paused = true)]
async fn json_sink_writes_one_document() {
    let senders = senders(2);
    let ledger = funded(SimulatedConfig::default(), &senders);
    let config = RunConfig::default()
        .with_senders(senders)
        .with_strategy(Strategy::Burst)
        .with_target_count(4);

    let mut sink = JsonSink::new(Vec::new());
    let report = BenchmarkRunner::new(ledger, config).run_into(&mut sink).await.unwrap();

    let written: serde_json::Value = serde_json::from_slice(&sink.into_inner()).unwrap();
    assert_eq!(written["submissions"]["accepted"], 4);
    assert_eq!(written["config"]["strategy"], "burst");
    assert_eq!(written["inclusion"]["estimate"]["included"], report.included());
}
