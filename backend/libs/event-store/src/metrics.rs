use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

#[derive(Clone)]
pub struct EventLogMetrics {
    pub appended: IntCounter,
    pub imported: IntCounter,
    pub replayed: IntCounter,
    pub replay_failures: IntCounter,
    pub pending_replay: IntGauge,
    pub unacknowledged: IntGauge,
}

impl EventLogMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let appended = counter(
            service,
            "event_log_appended_total",
            "Total number of events appended by local emitters",
        );
        let imported = counter(
            service,
            "event_log_imported_total",
            "Total number of peer events imported into the log",
        );
        let replayed = counter(
            service,
            "event_log_replayed_total",
            "Total number of events marked as replayed",
        );
        let replay_failures = counter(
            service,
            "event_log_replay_failures_total",
            "Total number of failed replay attempts",
        );
        let pending_replay = gauge(
            service,
            "event_log_pending_replay",
            "Number of events awaiting local replay",
        );
        let unacknowledged = gauge(
            service,
            "event_log_unacknowledged",
            "Number of locally emitted events not yet acknowledged by a peer",
        );

        for metric in [
            Box::new(appended.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(imported.clone()),
            Box::new(replayed.clone()),
            Box::new(replay_failures.clone()),
            Box::new(pending_replay.clone()),
            Box::new(unacknowledged.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register event log metric: {}", e);
            }
        }

        Self {
            appended,
            imported,
            replayed,
            replay_failures,
            pending_replay,
            unacknowledged,
        }
    }
}

fn counter(service: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for event log counter")
}

fn gauge(service: &str, name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for event log gauge")
}
