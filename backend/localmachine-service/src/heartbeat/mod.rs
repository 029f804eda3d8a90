//! Liveness of the change capture pipeline.
//!
//! The monitor writes the `cdc_heart_beat` row every interval and watches for
//! the same change coming back through CDC. Losing that signal, or never
//! seeing it after startup, means the capture state is broken: it is torn
//! down and the process exits so a restart rebuilds it from scratch.

mod recovery;
mod repository;

pub use recovery::{CdcRecovery, ExitTerminator, PgCdcRecovery, ProcessTerminator};
pub use repository::{HeartbeatRepository, InMemoryHeartbeatRepository, PgHeartbeatRepository};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cdc::{CdcListener, CdcRecord};
use crate::clock::Clock;
use crate::config::HeartbeatConfig;
use crate::error::ServiceResult;

pub const HEARTBEAT_TABLE: &str = "cdc_heart_beat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// No signal observed yet, still inside the startup window
    Starting,
    Alive,
    /// Signal was observed once, then lost
    StalledLostSignal,
    /// Startup window elapsed without any signal
    NeverStarted,
}

impl HeartbeatState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HeartbeatState::StalledLostSignal | HeartbeatState::NeverStarted
        )
    }
}

#[derive(Debug)]
struct Observation {
    state: HeartbeatState,
    last_observed: Option<DateTime<Utc>>,
}

pub struct HeartbeatMonitor {
    clock: Arc<dyn Clock>,
    repository: Arc<dyn HeartbeatRepository>,
    recovery: Arc<dyn CdcRecovery>,
    terminator: Arc<dyn ProcessTerminator>,
    config: HeartbeatConfig,
    started_at: DateTime<Utc>,
    observation: Mutex<Observation>,
    recovered: AtomicBool,
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

impl HeartbeatMonitor {
    pub fn new(
        clock: Arc<dyn Clock>,
        repository: Arc<dyn HeartbeatRepository>,
        recovery: Arc<dyn CdcRecovery>,
        terminator: Arc<dyn ProcessTerminator>,
        config: HeartbeatConfig,
    ) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            repository,
            recovery,
            terminator,
            config,
            started_at,
            observation: Mutex::new(Observation {
                state: HeartbeatState::Starting,
                last_observed: None,
            }),
            recovered: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> HeartbeatState {
        self.observation.lock().await.state
    }

    pub async fn last_observed(&self) -> Option<DateTime<Utc>> {
        self.observation.lock().await.last_observed
    }

    /// Write the heartbeat row, then judge liveness. Returns the resulting state.
    pub async fn tick(&self) -> HeartbeatState {
        let now = self.clock.now();

        if let Err(e) = self.repository.beat(now).await {
            warn!(error = %e, "Failed to write heartbeat row");
        }

        let state = {
            let mut observation = self.observation.lock().await;
            if !observation.state.is_terminal() {
                observation.state = match observation.last_observed {
                    Some(seen) if elapsed(seen, now) > self.config.stall_threshold => {
                        HeartbeatState::StalledLostSignal
                    }
                    None if elapsed(self.started_at, now) > self.config.startup_window => {
                        HeartbeatState::NeverStarted
                    }
                    _ => observation.state,
                };
            }
            observation.state
        };

        if state.is_terminal() {
            self.recover(state).await;
        } else {
            debug!(state = ?state, "Heartbeat tick");
        }
        state
    }

    async fn recover(&self, state: HeartbeatState) {
        if self.recovered.swap(true, Ordering::SeqCst) {
            return;
        }

        let reason = match state {
            HeartbeatState::NeverStarted => {
                error!(
                    startup_window_secs = self.config.startup_window.as_secs(),
                    "No CDC heartbeat observed since startup, resetting capture state"
                );
                if let Err(e) = self.recovery.clear_offsets().await {
                    error!(error = %e, "Failed to clear CDC offsets");
                }
                if let Err(e) = self.repository.delete().await {
                    error!(error = %e, "Failed to delete heartbeat row");
                }
                "cdc heartbeat never observed"
            }
            _ => {
                let last_observed = self.last_observed().await;
                error!(
                    last_observed = ?last_observed,
                    stall_threshold_secs = self.config.stall_threshold.as_secs(),
                    "CDC heartbeat lost, dropping replication slot"
                );
                "cdc heartbeat lost"
            }
        };

        if let Err(e) = self.recovery.drop_replication().await {
            error!(error = %e, "Failed to drop replication slot and publication");
        }
        self.terminator.terminate(reason);
    }

    /// Tick every interval until a terminal state is reached
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stall_threshold_secs = self.config.stall_threshold.as_secs(),
            startup_window_secs = self.config.startup_window.as_secs(),
            "Heartbeat monitor starting"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            if self.tick().await.is_terminal() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl CdcListener for HeartbeatMonitor {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn accepted_tables(&self) -> Vec<String> {
        vec![HEARTBEAT_TABLE.to_string()]
    }

    async fn on(&self, records: Vec<CdcRecord>) -> ServiceResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let mut observation = self.observation.lock().await;
        if observation.state.is_terminal() {
            return Ok(());
        }
        observation.last_observed = Some(now);
        if observation.state == HeartbeatState::Starting {
            info!("First CDC heartbeat observed");
            observation.state = HeartbeatState::Alive;
        }
        Ok(())
    }
}
