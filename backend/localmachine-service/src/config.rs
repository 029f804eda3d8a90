/// Configuration management for the localmachine sync engine
///
/// Loads configuration from environment variables (optionally seeded from `.env`).
use anyhow::{bail, Context, Result};
use db_pool::env_utils::{
    parse_env_list, parse_env_millis, parse_env_optional, parse_env_secs, parse_env_with_default,
};
use db_pool::DbConfig;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const SERVICE_NAME: &str = "localmachine-service";

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub database: DbConfig,
    pub cdc: CdcConfig,
    pub heartbeat: HeartbeatConfig,
    pub replay: ReplayConfig,
    pub sync: SyncConfig,
}

/// Which side of the sync topology this deployment plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    LocalMachine,
    OnlineWeb,
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "local_machine" | "localmachine" | "local" => Ok(NodeRole::LocalMachine),
            "online_web" | "onlineweb" | "web" => Ok(NodeRole::OnlineWeb),
            other => Err(format!("unknown node role: {}", other)),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::LocalMachine => write!(f, "local_machine"),
            NodeRole::OnlineWeb => write!(f, "online_web"),
        }
    }
}

/// Application settings
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Application environment (dev, staging, prod)
    pub env: String,
    pub role: NodeRole,
    /// Stable facility id of this deployment; sender id of everything it emits
    pub facility_id: String,
}

/// Change-data-capture settings
#[derive(Debug, Clone)]
pub struct CdcConfig {
    /// Logical replication slot owned by this deployment
    pub slot_name: String,
    pub publication_name: String,
    /// Tables mirrored to the online web as backup events
    pub backup_tables: Vec<String>,
    /// Reference tables broadcast as master data events
    pub master_data_tables: Vec<String>,
    /// Capacity of the batch channel between the capture task and the consumer
    pub channel_capacity: usize,
    /// Delay between two reads of the replication slot
    pub poll_interval: Duration,
    /// Upper bound of decoded changes per read (whole transactions are kept)
    pub max_changes: i64,
}

/// Liveness monitor thresholds
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    /// Max silence after a signal was observed
    pub stall_threshold: Duration,
    /// Max time to wait for the first signal after start
    pub startup_window: Duration,
}

/// Background replay settings
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Delay between drains; a failed event is retried on the next drain
    pub poll_interval: Duration,
    pub batch_size: i64,
    /// Retries of a group append that lost the sequence race
    pub max_append_retries: u32,
}

/// Peer synchronization settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Facility id of the online web peer
    pub peer_id: String,
    /// Database of the online web, reached directly by local machines;
    /// without it the sync agent does not run
    pub peer_database_url: Option<String>,
    pub interval: Duration,
    pub batch_size: i64,
    /// Master data snapshot is forced once the last one is older than this
    pub snapshot_max_age: Duration,
    /// ... or once more master data changes than this accumulated
    pub snapshot_change_threshold: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stall_threshold: Duration::from_secs(3 * 60),
            startup_window: Duration::from_secs(10 * 60),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 200,
            max_append_retries: 5,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peer_id: "online-web".to_string(),
            peer_database_url: None,
            interval: Duration::from_secs(30),
            batch_size: 500,
            snapshot_max_age: Duration::from_secs(24 * 60 * 60),
            snapshot_change_threshold: 1000,
        }
    }
}

fn default_backup_tables() -> Vec<String> {
    ["requisitions", "requisition_line_items", "proofs_of_delivery", "shipments"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_master_data_tables() -> Vec<String> {
    ["facilities", "orderables", "programs", "lots", "users"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let role = match std::env::var("NODE_ROLE") {
            Ok(raw) => raw
                .parse::<NodeRole>()
                .map_err(anyhow::Error::msg)
                .context("Invalid NODE_ROLE")?,
            Err(_) => NodeRole::LocalMachine,
        };

        let app = AppConfig {
            env: std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            role,
            facility_id: std::env::var("FACILITY_ID")
                .context("FACILITY_ID environment variable not set")?,
        };

        let database = DbConfig::from_env(SERVICE_NAME)
            .map_err(anyhow::Error::msg)
            .context("Failed to load database configuration")?;

        let cdc = CdcConfig {
            slot_name: std::env::var("CDC_SLOT_NAME")
                .unwrap_or_else(|_| "localmachine_slot".to_string()),
            publication_name: std::env::var("CDC_PUBLICATION_NAME")
                .unwrap_or_else(|_| "localmachine_publication".to_string()),
            backup_tables: parse_env_list("CDC_BACKUP_TABLES")
                .unwrap_or_else(default_backup_tables),
            master_data_tables: parse_env_list("CDC_MASTER_DATA_TABLES")
                .unwrap_or_else(default_master_data_tables),
            channel_capacity: parse_env_with_default("CDC_CHANNEL_CAPACITY", 256),
            poll_interval: parse_env_millis("CDC_POLL_INTERVAL_MILLIS", Duration::from_secs(1)),
            max_changes: parse_env_with_default("CDC_MAX_CHANGES", 1000),
        };

        let hb_defaults = HeartbeatConfig::default();
        let heartbeat = HeartbeatConfig {
            interval: parse_env_secs("HEARTBEAT_INTERVAL_SECS", hb_defaults.interval),
            stall_threshold: parse_env_secs(
                "HEARTBEAT_STALL_THRESHOLD_SECS",
                hb_defaults.stall_threshold,
            ),
            startup_window: parse_env_secs(
                "HEARTBEAT_STARTUP_WINDOW_SECS",
                hb_defaults.startup_window,
            ),
        };

        let replay_defaults = ReplayConfig::default();
        let replay = ReplayConfig {
            poll_interval: parse_env_secs(
                "REPLAY_POLL_INTERVAL_SECS",
                replay_defaults.poll_interval,
            ),
            batch_size: parse_env_with_default("REPLAY_BATCH_SIZE", replay_defaults.batch_size),
            max_append_retries: parse_env_with_default(
                "EVENT_APPEND_MAX_RETRIES",
                replay_defaults.max_append_retries,
            ),
        };

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            peer_id: parse_env_optional("SYNC_PEER_ID").unwrap_or(sync_defaults.peer_id),
            peer_database_url: parse_env_optional("SYNC_PEER_DATABASE_URL"),
            interval: parse_env_secs("SYNC_INTERVAL_SECS", sync_defaults.interval),
            batch_size: parse_env_with_default("SYNC_BATCH_SIZE", sync_defaults.batch_size),
            snapshot_max_age: parse_env_secs(
                "SNAPSHOT_MAX_AGE_SECS",
                sync_defaults.snapshot_max_age,
            ),
            snapshot_change_threshold: parse_env_with_default(
                "SNAPSHOT_CHANGE_THRESHOLD",
                sync_defaults.snapshot_change_threshold,
            ),
        };

        let config = Config {
            app,
            database,
            cdc,
            heartbeat,
            replay,
            sync,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.app.facility_id.trim().is_empty() {
            bail!("FACILITY_ID must not be empty");
        }
        if self.heartbeat.stall_threshold <= self.heartbeat.interval {
            bail!(
                "heartbeat stall threshold ({:?}) must exceed the tick interval ({:?})",
                self.heartbeat.stall_threshold,
                self.heartbeat.interval
            );
        }
        if self.app.role == NodeRole::OnlineWeb && self.app.facility_id != self.sync.peer_id {
            bail!(
                "online web FACILITY_ID ({}) must equal SYNC_PEER_ID ({})",
                self.app.facility_id,
                self.sync.peer_id
            );
        }
        if self.replay.batch_size <= 0 || self.sync.batch_size <= 0 || self.cdc.max_changes <= 0 {
            bail!("batch sizes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "NODE_ROLE",
            "FACILITY_ID",
            "CDC_BACKUP_TABLES",
            "HEARTBEAT_STALL_THRESHOLD_SECS",
            "HEARTBEAT_INTERVAL_SECS",
            "SYNC_PEER_ID",
            "SYNC_PEER_DATABASE_URL",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_default_values() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("FACILITY_ID", "F1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.app.env, "development");
        assert_eq!(config.app.role, NodeRole::LocalMachine);
        assert_eq!(config.app.facility_id, "F1");
        assert_eq!(config.heartbeat.interval, Duration::from_secs(60));
        assert_eq!(config.heartbeat.stall_threshold, Duration::from_secs(180));
        assert_eq!(config.heartbeat.startup_window, Duration::from_secs(600));
        assert_eq!(config.sync.peer_id, "online-web");
        assert_eq!(config.sync.peer_database_url, None);
        assert!(config.cdc.backup_tables.contains(&"requisitions".to_string()));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("FACILITY_ID", "WEB");
        std::env::set_var("NODE_ROLE", "online-web");
        std::env::set_var("SYNC_PEER_ID", "WEB");
        std::env::set_var("CDC_BACKUP_TABLES", "a, b,,c");

        let config = Config::from_env().unwrap();

        assert_eq!(config.app.role, NodeRole::OnlineWeb);
        assert_eq!(config.cdc.backup_tables, vec!["a", "b", "c"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_facility_id() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");

        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_rejects_stall_threshold_below_interval() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("FACILITY_ID", "F1");
        std::env::set_var("HEARTBEAT_STALL_THRESHOLD_SECS", "30");

        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_online_web_must_be_its_own_peer() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://test");
        std::env::set_var("FACILITY_ID", "WEB");
        std::env::set_var("NODE_ROLE", "web");

        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("LOCAL_MACHINE".parse::<NodeRole>(), Ok(NodeRole::LocalMachine));
        assert_eq!("web".parse::<NodeRole>(), Ok(NodeRole::OnlineWeb));
        assert!("android".parse::<NodeRole>().is_err());
    }
}
