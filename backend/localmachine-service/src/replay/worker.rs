use event_store::metrics::EventLogMetrics;
use event_store::EventStore;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use super::{ReplayDispatcher, ReplaySummary};
use crate::config::ReplayConfig;

/// Background loop draining the replay backlog.
///
/// Runs a pass every `poll_interval`, or earlier when [`ReplayWorker::trigger`]
/// is called (e.g. right after a peer batch was imported). Failed events are
/// simply picked up again by a later pass.
pub struct ReplayWorker<S: EventStore> {
    dispatcher: Arc<ReplayDispatcher<S>>,
    config: ReplayConfig,
    wake: Arc<Notify>,
    metrics: Option<EventLogMetrics>,
}

impl<S: EventStore + 'static> ReplayWorker<S> {
    pub fn new(dispatcher: Arc<ReplayDispatcher<S>>, config: ReplayConfig) -> Self {
        Self {
            dispatcher,
            config,
            wake: Arc::new(Notify::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: EventLogMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Handle that wakes the loop before the poll interval elapses
    pub fn trigger(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn dispatcher(&self) -> &Arc<ReplayDispatcher<S>> {
        &self.dispatcher
    }

    /// One replay pass followed by a gauge refresh
    pub async fn run_once(&self) -> ReplaySummary {
        let summary = match self.dispatcher.replay_pending(self.config.batch_size).await {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Replay pass failed");
                ReplaySummary::default()
            }
        };

        if let Some(metrics) = &self.metrics {
            if let Ok((pending, unacknowledged)) = self.dispatcher.store().pending_stats().await {
                metrics.pending_replay.set(pending);
                metrics.unacknowledged.set(unacknowledged);
            }
        }

        summary
    }

    /// Run forever. Spawn as a background task.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Replay worker starting"
        );

        loop {
            let summary = self.run_once().await;
            if summary.replayed == 0 && summary.failed == 0 {
                debug!("Nothing to replay");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.wake.notified() => {
                    debug!("Replay worker woken early");
                }
            }
        }
    }
}
