//! PostgreSQL pool setup for the sync engine.
//!
//! A local machine talks to one embedded database, plus the online web's
//! database when it syncs directly, so pools stay small. Every connection
//! reports the service name as `application_name`, which tells the local and
//! peer pools apart in `pg_stat_activity`.

pub mod env_utils;

use env_utils::{parse_env_secs, parse_env_with_default};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct DbConfig {
    /// Reported as `application_name` and used in log fields
    pub service_name: String,
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Budget for the startup verification query
    pub connect_timeout: Duration,
    /// How long a caller waits for a free connection
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout", &self.connect_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_lifetime", &self.max_lifetime)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("unknown"),
            database_url: String::new(),
            max_connections: 10,
            min_connections: 2,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL` is required; `DB_*` variables override the defaults
    pub fn from_env(service_name: &str) -> Result<Self, String> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable not set".to_string())?;
        let d = Self::default();

        Ok(Self {
            service_name: service_name.to_string(),
            database_url,
            max_connections: parse_env_with_default("DB_MAX_CONNECTIONS", d.max_connections),
            min_connections: parse_env_with_default("DB_MIN_CONNECTIONS", d.min_connections),
            connect_timeout: parse_env_secs("DB_CONNECT_TIMEOUT_SECS", d.connect_timeout),
            acquire_timeout: parse_env_secs("DB_ACQUIRE_TIMEOUT_SECS", d.acquire_timeout),
            idle_timeout: parse_env_secs("DB_IDLE_TIMEOUT_SECS", d.idle_timeout),
            max_lifetime: parse_env_secs("DB_MAX_LIFETIME_SECS", d.max_lifetime),
        })
    }

    /// Same database settings for a second pool on another server
    pub fn for_peer(
        &self,
        service_name: impl Into<String>,
        database_url: impl Into<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            database_url: database_url.into(),
            ..self.clone()
        }
    }

    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            connect_timeout_secs = self.connect_timeout.as_secs(),
            acquire_timeout_secs = self.acquire_timeout.as_secs(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            max_lifetime_secs = self.max_lifetime.as_secs(),
            "Database pool configuration"
        );
    }
}

/// Open a pool and check that the server answers within `connect_timeout`
pub async fn create_pool(config: DbConfig) -> Result<PgPool, sqlx::Error> {
    let options =
        PgConnectOptions::from_str(&config.database_url)?.application_name(&config.service_name);

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .test_before_acquire(true)
        .connect_with(options)
        .await?;

    match tokio::time::timeout(config.connect_timeout, sqlx::query("SELECT 1").execute(&pool))
        .await
    {
        Ok(Ok(_)) => {
            info!(service = %config.service_name, "Database pool ready");
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(service = %config.service_name, error = %e, "Database verification failed");
            Err(e)
        }
        Err(_) => {
            error!(
                service = %config.service_name,
                timeout_secs = config.connect_timeout.as_secs(),
                "Database verification timed out"
            );
            Err(sqlx::Error::PoolTimedOut)
        }
    }
}
