use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cadence_core::{AppError, AppResult};
use cadence_domain::{CoordinatorState, JobDefinition, NodeId};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{CronEngine, JobFuture, JobRunner, LeaderElector, SchedulingConfig};

#[derive(Debug)]
struct Lifecycle {
    state: CoordinatorState,
    group: Option<String>,
}

/// Runs cron jobs on exactly one node of a group.
///
/// Jobs are registered with the engine wrapped in a leader check, so every
/// node ticks but only the elected one runs the body. The lifecycle moves
/// `Init -> Pending -> Started -> Stopped` under one lock, and the group
/// name is frozen on the first registration.
pub struct ScheduleCoordinator {
    engine: CronEngine,
    elector: Arc<LeaderElector>,
    config: SchedulingConfig,
    lifecycle: Arc<Mutex<Lifecycle>>,
    task_sequence: AtomicUsize,
}

impl ScheduleCoordinator {
    /// Creates a coordinator in the `Init` state.
    #[must_use]
    pub fn new(engine: CronEngine, elector: Arc<LeaderElector>, config: SchedulingConfig) -> Self {
        Self {
            engine,
            elector,
            config,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                state: CoordinatorState::Init,
                group: None,
            })),
            task_sequence: AtomicUsize::new(0),
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.lifecycle().state
    }

    /// Returns the coordination group, frozen on the first registration.
    #[must_use]
    pub fn group(&self) -> Option<String> {
        self.lifecycle().group.clone()
    }

    /// Returns this node's identifier.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        self.elector.node_id()
    }

    /// Returns the underlying engine.
    #[must_use]
    pub fn engine(&self) -> &CronEngine {
        &self.engine
    }

    /// Returns the elector gating job bodies.
    #[must_use]
    pub fn elector(&self) -> &Arc<LeaderElector> {
        &self.elector
    }

    /// Returns scheduling settings.
    #[must_use]
    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    /// Reports whether this node currently leads the group.
    pub async fn is_leader(&self) -> bool {
        match self.group() {
            Some(group) => self.elector.is_leader(group.as_str()).await,
            None => false,
        }
    }

    /// Registers a job whose body runs only on the group leader.
    ///
    /// The schedule is validated before any state change. The first call
    /// moves `Init -> Pending`. Fails with [`AppError::Conflict`] once the
    /// coordinator is stopped. With scheduling disabled, the body is
    /// registered without the leader check.
    pub fn schedule_distributed_job(
        &self,
        definition: JobDefinition,
        body: JobRunner,
    ) -> AppResult<()> {
        definition.schedule()?;

        let group = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                CoordinatorState::Init => {
                    let group = self.config.resolve_group();
                    lifecycle.state = CoordinatorState::Pending;
                    lifecycle.group = Some(group.clone());
                    info!(
                        group = %group,
                        node_id = %self.elector.node_id(),
                        "distributed scheduling pending"
                    );
                    group
                }
                CoordinatorState::Pending | CoordinatorState::Started => lifecycle
                    .group
                    .clone()
                    .unwrap_or_else(|| self.config.resolve_group()),
                CoordinatorState::Stopped => {
                    return Err(AppError::Conflict(format!(
                        "cannot schedule job '{}' after the coordinator stopped",
                        definition.name()
                    )));
                }
            }
        };

        let runner = if self.config.enabled {
            leader_gated(
                Arc::clone(&self.elector),
                Arc::clone(&self.lifecycle),
                group,
                definition.name().to_owned(),
                body,
            )
        } else {
            body
        };

        self.engine.register(definition, runner)
    }

    /// Registers an anonymous leader-gated task and returns its job name.
    pub fn schedule_distributed_task(
        &self,
        expression: &str,
        includes_seconds: bool,
        body: JobRunner,
    ) -> AppResult<String> {
        let sequence = self.task_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("distributed-task-{sequence}");
        let definition = JobDefinition::new(name.as_str(), expression, includes_seconds)?;

        self.schedule_distributed_job(definition, body)?;
        Ok(name)
    }

    /// Starts the engine. Only effective from `Pending`.
    pub fn start_async(&self) -> bool {
        let group = {
            let mut lifecycle = self.lifecycle();
            if !lifecycle.state.can_transition_to(CoordinatorState::Started) {
                debug!(state = %lifecycle.state, "distributed scheduling start ignored");
                return false;
            }
            lifecycle.state = CoordinatorState::Started;
            lifecycle.group.clone()
        };

        self.engine.start();
        info!(
            group = group.as_deref().unwrap_or_default(),
            node_id = %self.elector.node_id(),
            enabled = self.config.enabled,
            "distributed scheduling started"
        );
        true
    }

    /// Starts the engine and waits until it is stopped.
    pub async fn start_blocking(&self) {
        if self.start_async() {
            self.engine.stopped().await;
        }
    }

    /// Stops scheduling. Only effective from `Started`.
    ///
    /// The engine stops first, then leader renewal. A leader record held by
    /// this node is shortened to the configured grace instead of deleted.
    pub async fn stop(&self) -> bool {
        let group = {
            let mut lifecycle = self.lifecycle();
            if !lifecycle.state.can_transition_to(CoordinatorState::Stopped) {
                debug!(state = %lifecycle.state, "distributed scheduling stop ignored");
                return false;
            }
            lifecycle.state = CoordinatorState::Stopped;
            lifecycle.group.clone()
        };

        self.engine.stop().await;

        if self.config.enabled
            && let Some(group) = group
        {
            let grace = self.elector.config().step_down_grace;
            match self.elector.step_down(group.as_str(), grace).await {
                Ok(true) => {}
                Ok(false) => debug!(group = %group, "not leader at shutdown"),
                Err(error) => {
                    warn!(
                        group = %group,
                        error = %error,
                        "failed to shorten leader lease at shutdown"
                    );
                }
            }
        }

        info!("distributed scheduling stopped");
        true
    }

    /// Fires the job named `name` once, outside its schedule.
    ///
    /// Leader gating still applies.
    pub fn trigger_job(&self, name: &str) -> AppResult<()> {
        if self.engine.job(name).is_none() {
            return Err(AppError::NotFound(format!("job '{name}' is not scheduled")));
        }

        self.engine.run_by_tag(name).map(|_| ())
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn leader_gated(
    elector: Arc<LeaderElector>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    group: String,
    job: String,
    body: JobRunner,
) -> JobRunner {
    Arc::new(move || -> JobFuture {
        let elector = Arc::clone(&elector);
        let lifecycle = Arc::clone(&lifecycle);
        let group = group.clone();
        let job = job.clone();
        let body = Arc::clone(&body);

        Box::pin(async move {
            let stopped = || {
                lifecycle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .state
                    == CoordinatorState::Stopped
            };
            if stopped() {
                debug!(job = %job, "coordinator stopped, skipping");
                return Ok(());
            }

            if !elector.try_become_leader(group.as_str()).await {
                debug!(job = %job, group = %group, "not leader, skipping");
                return Ok(());
            }
            // stop() may have run while the election was in flight.
            if stopped() {
                debug!(job = %job, "coordinator stopped during election, skipping");
                return Ok(());
            }

            let started = Instant::now();
            let result = body().await;
            debug!(
                job = %job,
                group = %group,
                took_ms = started.elapsed().as_millis(),
                succeeded = result.is_ok(),
                "leader ran job"
            );
            result
        })
    })
}
