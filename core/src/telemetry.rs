use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ingest_core=info,runner_container=info,bootstrap=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestMetrics {
    pub messages_received: usize,
    pub messages_acknowledged: usize,
    pub messages_left_for_redelivery: usize,
    /// deleted after exhausting the retry policy, dead-lettered or not
    pub messages_abandoned: usize,
    pub messages_dead_lettered: usize,
    pub dead_letter_failures: usize,
    pub test_events_skipped: usize,
    pub delete_failures: usize,
    pub receive_errors: usize,
    pub rows_loaded: usize,
    pub bytes_fetched: u64,
}
