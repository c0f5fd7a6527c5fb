//! Cadence scheduling worker runtime.

#![forbid(unsafe_code)]

mod worker_config;

use std::sync::Arc;
use std::time::Duration;

use cadence_application::{
    CronEngine, DistributedMutex, KeyValueStore, LeaderElector, ScheduleCoordinator, job_runner,
    post_job_hook,
};
use cadence_core::{AppError, AppResult};
use cadence_domain::{CronSchedule, JobDefinition, NodeId};
use cadence_infrastructure::{InMemoryKeyValueStore, RedisKeyValueStore};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::worker_config::WorkerConfig;

const COMPACTION_LOCK_KEY: &str = "worker:compaction";

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let store = build_store(&config).await?;

    let node_id = NodeId::new();
    let elector = Arc::new(LeaderElector::new(
        Arc::clone(&store),
        node_id.clone(),
        config.leader.clone(),
    ));
    let engine = CronEngine::with_zone(config.schedule_zone);
    engine.add_post_job_hook(post_job_hook(|info, stats| {
        match stats.outcome.error_message() {
            Some(error) => warn!(
                job = %info.name,
                took_ms = stats.took.as_millis(),
                error = %error,
                "scheduled job did not succeed"
            ),
            None => {
                debug!(job = %info.name, took_ms = stats.took.as_millis(), "scheduled job done");
            }
        }
        Ok(())
    }));

    let coordinator = ScheduleCoordinator::new(engine, elector, config.scheduling.clone());
    let mutex = DistributedMutex::new(Arc::clone(&store), config.lock);
    schedule_jobs(&coordinator, &config, &node_id, mutex)?;

    info!(
        node_id = %node_id,
        group = coordinator.group().as_deref().unwrap_or_default(),
        scheduling_enabled = config.scheduling.enabled,
        "cadence-worker started"
    );
    coordinator.start_async();

    shutdown_signal().await?;
    info!(node_id = %node_id, "shutdown signal received");
    coordinator.stop().await;

    Ok(())
}

async fn build_store(config: &WorkerConfig) -> AppResult<Arc<dyn KeyValueStore>> {
    let Some(redis_url) = config.redis_url.as_deref() else {
        warn!("REDIS_URL is not set, coordinating through a process-local store");
        return Ok(Arc::new(InMemoryKeyValueStore::new()));
    };

    let client = redis::Client::open(redis_url)
        .map_err(|error| AppError::Validation(format!("invalid REDIS_URL: {error}")))?;
    let store = RedisKeyValueStore::connect(client, config.redis_key_prefix.as_str()).await?;
    Ok(Arc::new(store))
}

fn schedule_jobs(
    coordinator: &ScheduleCoordinator,
    config: &WorkerConfig,
    node_id: &NodeId,
    mutex: DistributedMutex,
) -> AppResult<()> {
    let heartbeat = JobDefinition::new(
        "heartbeat",
        config.heartbeat_cron.as_str(),
        CronSchedule::guess_includes_seconds(config.heartbeat_cron.as_str()),
    )?
    .with_execution_log(false);
    let heartbeat_node = node_id.clone();
    coordinator.schedule_distributed_job(
        heartbeat,
        job_runner(move || {
            let node_id = heartbeat_node.clone();
            async move {
                info!(node_id = %node_id, "leader heartbeat");
                Ok(())
            }
        }),
    )?;

    let compaction = JobDefinition::new(
        "compaction",
        config.compaction_cron.as_str(),
        CronSchedule::guess_includes_seconds(config.compaction_cron.as_str()),
    )?
    .with_tag("maintenance")
    .with_trigger_on_bootstrap(true);
    coordinator.schedule_distributed_job(
        compaction,
        job_runner(move || {
            let mutex = mutex.clone();
            async move { run_compaction(&mutex).await }
        }),
    )?;

    Ok(())
}

async fn run_compaction(mutex: &DistributedMutex) -> AppResult<()> {
    let result = mutex
        .run_locked(COMPACTION_LOCK_KEY, || async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            info!("compaction pass finished");
            Ok(())
        })
        .await;

    match result {
        Err(error) if error.is_contention() => {
            debug!(key = COMPACTION_LOCK_KEY, "compaction already running elsewhere");
            Ok(())
        }
        other => other,
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn shutdown_signal() -> AppResult<()> {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|error| AppError::Internal(format!("failed to listen for Ctrl-C: {error}")))
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|error| {
                AppError::Internal(format!("failed to install SIGTERM handler: {error}"))
            })?;
        signal.recv().await;
        Ok::<(), AppError>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<AppResult<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}
