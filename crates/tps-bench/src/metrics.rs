use metrics::{Counter, Gauge, Histogram};
use metrics_derive::Metrics;

#[derive(Metrics, Clone)]
#[metrics(scope = "tps_bench")]
pub(crate) struct HarnessMetrics {
    #[metric(describe = "Submissions accepted into the ledger queue")]
    pub(crate) submissions_accepted: Counter,

    #[metric(describe = "Submissions that were rejected, timed out or failed in transport")]
    pub(crate) submissions_failed: Counter,

    #[metric(describe = "Round-trip time of a submit call")]
    pub(crate) submit_duration: Histogram,

    #[metric(describe = "Confirmation poll rounds completed")]
    pub(crate) poll_rounds: Counter,

    #[metric(describe = "Receipt queries issued by the confirmation poller")]
    pub(crate) receipts_queried: Counter,

    #[metric(describe = "Receipt queries that returned an error")]
    pub(crate) receipt_errors: Counter,

    #[metric(describe = "Estimated number of included submissions")]
    pub(crate) inclusion_estimate: Gauge,
}
