use anyhow::{Context, Result};
use event_store::metrics::EventLogMetrics;
use event_store::PostgresEventStore;
use localmachine_service::cdc::{
    CdcConsumer, CdcDispatcher, CdcListener, OffsetStore, PgLogicalCapture, PgOffsetStore,
};
use localmachine_service::clock::{Clock, SystemClock};
use localmachine_service::config::{Config, NodeRole, SERVICE_NAME};
use localmachine_service::emitters::{
    BackupDatabaseEmitter, LocalMovementEventEmitter, MasterDataEmitter,
};
use localmachine_service::heartbeat::{
    ExitTerminator, HeartbeatMonitor, PgCdcRecovery, PgHeartbeatRepository,
};
use localmachine_service::publisher::EventPublisher;
use localmachine_service::replay::{replayers, ReplayDispatcher, ReplayWorker};
use localmachine_service::services::ReplayServices;
use localmachine_service::sync::{
    InProcessTransport, LocalSyncAgent, OnlineSyncService, PgMasterDataSource, PgPeerRegistry,
    SnapshotScheduler,
};
use resilience::RetryConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

/// Stable id of this installation, kept across restarts
async fn machine_id(pool: &sqlx::PgPool) -> Result<Uuid> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO local_machine_identity (id, machine_id)
        VALUES (1, $1)
        ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
        RETURNING machine_id
        "#,
    )
    .bind(Uuid::new_v4())
    .fetch_one(pool)
    .await
    .context("Failed to load machine id")?;
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    init_tracing();

    info!("Starting {}", SERVICE_NAME);

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        env = %config.app.env,
        role = %config.app.role,
        facility_id = %config.app.facility_id,
        "Configuration loaded"
    );

    config.database.log_config();
    let pool = db_pool::create_pool(config.database.clone())
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let metrics = EventLogMetrics::new(SERVICE_NAME);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(PostgresEventStore::new(
        pool.clone(),
        config.app.facility_id.clone(),
    ));
    let publisher = EventPublisher::new(store.clone())
        .with_retry(RetryConfig {
            max_retries: config.replay.max_append_retries,
            ..RetryConfig::contention()
        })
        .with_metrics(metrics.clone());

    // Replay
    let services = ReplayServices::postgres(pool.clone(), publisher.clone(), &config.sync.peer_id);
    let dispatcher = Arc::new(
        ReplayDispatcher::new(store.clone(), replayers::all(&services))
            .with_metrics(metrics.clone()),
    );
    let replay_worker = Arc::new(
        ReplayWorker::new(dispatcher, config.replay.clone()).with_metrics(metrics.clone()),
    );
    let replay_trigger = replay_worker.trigger();

    // Change capture
    let offsets: Arc<dyn OffsetStore> = Arc::new(PgOffsetStore::new(pool.clone()));
    let monitor = Arc::new(HeartbeatMonitor::new(
        clock.clone(),
        Arc::new(PgHeartbeatRepository::new(pool.clone())),
        Arc::new(PgCdcRecovery::new(
            pool.clone(),
            offsets.clone(),
            config.cdc.slot_name.clone(),
            config.cdc.publication_name.clone(),
        )),
        Arc::new(ExitTerminator),
        config.heartbeat.clone(),
    ));

    let master_data_emitter = Arc::new(MasterDataEmitter::new(
        publisher.clone(),
        config.cdc.master_data_tables.clone(),
    ));
    let heartbeat_listener: Arc<dyn CdcListener> = monitor.clone();
    let mut listeners = vec![heartbeat_listener];
    match config.app.role {
        NodeRole::LocalMachine => {
            listeners.push(Arc::new(LocalMovementEventEmitter::new(publisher.clone())));
            listeners.push(Arc::new(BackupDatabaseEmitter::new(
                publisher.clone(),
                config.cdc.backup_tables.clone(),
            )));
        }
        NodeRole::OnlineWeb => listeners.push(master_data_emitter.clone()),
    }
    let cdc_dispatcher = Arc::new(CdcDispatcher::new(listeners));

    let capture = PgLogicalCapture::new(
        pool.clone(),
        offsets.clone(),
        config.cdc.slot_name.clone(),
        config.cdc.publication_name.clone(),
        cdc_dispatcher.watched_tables(),
    )
    .with_limits(config.cdc.poll_interval, config.cdc.max_changes);
    let consumer = Arc::new(CdcConsumer::new(
        cdc_dispatcher,
        offsets,
        config.cdc.slot_name.clone(),
    ));
    let (batch_tx, batch_rx) = mpsc::channel(config.cdc.channel_capacity);

    let mut join_set = JoinSet::new();

    join_set.spawn(capture.run(batch_tx));
    join_set.spawn(consumer.run(batch_rx));
    join_set.spawn(monitor.run());
    {
        let worker = replay_worker.clone();
        join_set.spawn(async move { worker.start().await });
    }

    match config.app.role {
        NodeRole::LocalMachine => match &config.sync.peer_database_url {
            Some(peer_url) => {
                let peer_db = config
                    .database
                    .for_peer(format!("{}-peer", SERVICE_NAME), peer_url.as_str());
                let peer_pool = db_pool::create_pool(peer_db)
                    .await
                    .context("Failed to connect to online web database")?;

                let peer_store = Arc::new(PostgresEventStore::new(
                    peer_pool.clone(),
                    config.sync.peer_id.clone(),
                ));
                let online = Arc::new(OnlineSyncService::new(
                    peer_store,
                    Arc::new(PgPeerRegistry::new(peer_pool)),
                    clock.clone(),
                    config.sync.batch_size,
                ));
                let agent = LocalSyncAgent::new(
                    store.clone(),
                    Arc::new(InProcessTransport::new(online)),
                    config.sync.clone(),
                    machine_id(&pool).await?,
                )
                .with_replay_trigger(replay_trigger);
                join_set.spawn(async move { agent.start().await });
                info!(peer_id = %config.sync.peer_id, "Sync agent started");
            }
            None => {
                warn!("SYNC_PEER_DATABASE_URL not set, running offline");
            }
        },
        NodeRole::OnlineWeb => {
            let scheduler = SnapshotScheduler::new(
                store.clone(),
                master_data_emitter,
                Arc::new(PgMasterDataSource::new(
                    pool.clone(),
                    config.cdc.master_data_tables.clone(),
                )),
                clock.clone(),
                config.sync.clone(),
            );
            join_set.spawn(async move { scheduler.start().await });
            info!("Master data snapshot scheduler started");
        }
    }

    info!("{} is running", SERVICE_NAME);

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {
                info!("Task completed successfully");
            }
            Ok(Err(e)) => {
                tracing::error!("Task failed: {:#}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Task panicked: {:#}", e);
                return Err(anyhow::anyhow!("Task panicked: {}", e));
            }
        }
    }

    info!("{} shutting down", SERVICE_NAME);
    Ok(())
}
