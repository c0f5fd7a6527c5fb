//! In-process cron dispatcher.
//!
//! One dispatch task sleeps until the earliest due job, fires every due job
//! on its own task, and recomputes next runs. Job bodies run isolated from
//! the dispatcher: errors and panics become a [`JobOutcome`] handed to
//! post-execution hooks.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use cadence_core::{AppError, AppResult};
use cadence_domain::{
    CronSchedule, JobDefinition, JobExecStats, JobInfo, JobOutcome, JobState, ScheduleZone,
};
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_secs(60);

/// Future returned by one job invocation.
pub type JobFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'static>>;

/// Factory producing one job invocation per trigger.
pub type JobRunner = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Hook run before every job invocation.
pub type PreJobHook = Arc<dyn Fn(&JobInfo) -> AppResult<()> + Send + Sync>;

/// Hook run after every job invocation with its timing and outcome.
pub type PostJobHook = Arc<dyn Fn(&JobInfo, &JobExecStats) -> AppResult<()> + Send + Sync>;

/// Wraps an async closure into a [`JobRunner`].
pub fn job_runner<F, Fut>(body: F) -> JobRunner
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<()>> + Send + 'static,
{
    Arc::new(move || -> JobFuture { Box::pin(body()) })
}

/// Wraps a closure into a [`PreJobHook`].
pub fn pre_job_hook<F>(hook: F) -> PreJobHook
where
    F: Fn(&JobInfo) -> AppResult<()> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Wraps a closure into a [`PostJobHook`].
pub fn post_job_hook<F>(hook: F) -> PostJobHook
where
    F: Fn(&JobInfo, &JobExecStats) -> AppResult<()> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Point-in-time view of one registered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    /// Unique job name.
    pub name: String,
    /// Cron expression as registered.
    pub expression: String,
    /// Extra tags the job answers to.
    pub tags: Vec<String>,
    /// Current state.
    pub state: JobState,
    /// Next scheduled trigger, known once the engine runs.
    pub next_run: Option<DateTime<Utc>>,
    /// Invocations currently executing.
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnginePhase {
    Idle,
    Running,
    Stopped,
}

impl EnginePhase {
    fn resting_job_state(self) -> JobState {
        match self {
            Self::Idle => JobState::Pending,
            Self::Running => JobState::Scheduled,
            Self::Stopped => JobState::Stopped,
        }
    }
}

struct JobStatus {
    state: JobState,
    in_flight: usize,
    next_run: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    definition: JobDefinition,
    schedule: CronSchedule,
    runner: JobRunner,
    status: Mutex<JobStatus>,
}

impl ScheduledJob {
    fn status(&self) -> std::sync::MutexGuard<'_, JobStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> JobSnapshot {
        let status = self.status();
        JobSnapshot {
            name: self.definition.name().to_owned(),
            expression: self.definition.expression().to_owned(),
            tags: self.definition.tags().to_vec(),
            state: status.state,
            next_run: status.next_run,
            in_flight: status.in_flight,
        }
    }
}

struct EngineInner {
    jobs: RwLock<Vec<Arc<ScheduledJob>>>,
    pre_hooks: RwLock<Vec<PreJobHook>>,
    post_hooks: RwLock<Vec<PostJobHook>>,
    phase: Mutex<EnginePhase>,
    shutdown: CancellationToken,
    wakeup: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    zone: ScheduleZone,
}

impl EngineInner {
    fn phase(&self) -> EnginePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs(&self) -> Vec<Arc<ScheduledJob>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn pre_hooks(&self) -> Vec<PreJobHook> {
        self.pre_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn post_hooks(&self) -> Vec<PostJobHook> {
        self.post_hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Named, tag-addressable jobs fired on cron schedules.
///
/// Cheap to clone; clones share the same jobs and dispatcher. Cron fields
/// are matched against UTC wall-clock time unless the engine is built with
/// [`CronEngine::with_zone`]; the host's local zone is never used implicitly.
/// Runs of one job may overlap when a body outlasts its period.
#[derive(Clone)]
pub struct CronEngine {
    inner: Arc<EngineInner>,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEngine {
    /// Creates an idle engine with no jobs, evaluating schedules in UTC.
    #[must_use]
    pub fn new() -> Self {
        Self::with_zone(ScheduleZone::Utc)
    }

    /// Creates an idle engine whose schedules follow the wall clock of `zone`.
    #[must_use]
    pub fn with_zone(zone: ScheduleZone) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                jobs: RwLock::new(Vec::new()),
                pre_hooks: RwLock::new(Vec::new()),
                post_hooks: RwLock::new(Vec::new()),
                phase: Mutex::new(EnginePhase::Idle),
                shutdown: CancellationToken::new(),
                wakeup: Notify::new(),
                dispatcher: Mutex::new(None),
                zone,
            }),
        }
    }

    /// Registers a job.
    ///
    /// Fails with [`AppError::Validation`] on a malformed expression and with
    /// [`AppError::Conflict`] on a duplicate name or a stopped engine. Jobs
    /// registered before [`CronEngine::start`] do not fire until then.
    pub fn register(&self, definition: JobDefinition, runner: JobRunner) -> AppResult<()> {
        let schedule = definition.schedule().map_err(|error| {
            AppError::Validation(format!(
                "job '{}' has an invalid schedule: {error}",
                definition.name()
            ))
        })?;

        let phase = self.inner.phase();
        if phase == EnginePhase::Stopped {
            return Err(AppError::Conflict(format!(
                "cannot register job '{}' on a stopped engine",
                definition.name()
            )));
        }

        let next_run = match phase {
            EnginePhase::Running => schedule.next_after_in(Utc::now(), self.inner.zone),
            EnginePhase::Idle | EnginePhase::Stopped => None,
        };
        let job = Arc::new(ScheduledJob {
            status: Mutex::new(JobStatus {
                state: phase.resting_job_state(),
                in_flight: 0,
                next_run,
            }),
            definition,
            schedule,
            runner,
        });

        {
            let mut jobs = self.inner.jobs.write().unwrap_or_else(PoisonError::into_inner);
            if jobs
                .iter()
                .any(|existing| existing.definition.name() == job.definition.name())
            {
                return Err(AppError::Conflict(format!(
                    "job '{}' is already registered",
                    job.definition.name()
                )));
            }
            jobs.push(Arc::clone(&job));
        }

        debug!(
            job = %job.definition.name(),
            expression = %job.definition.expression(),
            "registered cron job"
        );

        if phase == EnginePhase::Running {
            self.inner.wakeup.notify_one();
            if job.definition.trigger_on_bootstrap() {
                fire(&self.inner, job);
            }
        }

        Ok(())
    }

    /// Adds a hook run before every invocation. Ignored once the engine runs.
    pub fn add_pre_job_hook(&self, hook: PreJobHook) -> bool {
        if self.inner.phase() != EnginePhase::Idle {
            warn!("cron engine already started, ignoring pre-execution hook");
            return false;
        }

        self.inner
            .pre_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
        true
    }

    /// Adds a hook run after every invocation. Ignored once the engine runs.
    pub fn add_post_job_hook(&self, hook: PostJobHook) -> bool {
        if self.inner.phase() != EnginePhase::Idle {
            warn!("cron engine already started, ignoring post-execution hook");
            return false;
        }

        self.inner
            .post_hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(hook);
        true
    }

    /// Starts dispatching and fires bootstrap jobs once.
    ///
    /// Must be called inside a tokio runtime. Returns false when the engine
    /// is already running or was stopped.
    pub fn start(&self) -> bool {
        {
            let mut phase = self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != EnginePhase::Idle {
                warn!(phase = ?*phase, "cron engine start ignored");
                return false;
            }
            *phase = EnginePhase::Running;
        }

        let now = Utc::now();
        let jobs = self.inner.jobs();
        for job in &jobs {
            let mut status = job.status();
            status.next_run = job.schedule.next_after_in(now, self.inner.zone);
            if status.in_flight == 0 {
                status.state = JobState::Scheduled;
            }
        }

        let handle = tokio::spawn(dispatch(Arc::clone(&self.inner)));
        *self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!(jobs = jobs.len(), "cron engine started");

        for job in jobs {
            if job.definition.trigger_on_bootstrap() {
                fire(&self.inner, job);
            }
        }

        true
    }

    /// Starts dispatching and waits until the engine is stopped.
    pub async fn start_blocking(&self) {
        self.start();
        self.stopped().await;
    }

    /// Resolves once [`CronEngine::stop`] has been called.
    pub async fn stopped(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Stops scheduling new runs.
    ///
    /// In-flight invocations finish on their own; nothing is cancelled.
    pub async fn stop(&self) {
        {
            let mut phase = self.inner.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase == EnginePhase::Stopped {
                return;
            }
            *phase = EnginePhase::Stopped;
        }

        self.inner.shutdown.cancel();
        for job in self.inner.jobs() {
            let mut status = job.status();
            status.next_run = None;
            if status.in_flight == 0 {
                status.state = JobState::Stopped;
            }
        }

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher
            && let Err(error) = dispatcher.await
        {
            warn!(error = %error, "cron dispatcher ended abnormally");
        }

        info!("cron engine stopped");
    }

    /// Fires every job addressed by `tag` once, outside its schedule.
    ///
    /// Only a running engine fires jobs; before [`CronEngine::start`] and
    /// after [`CronEngine::stop`] this fails with [`AppError::Conflict`]. The
    /// regular next run is left untouched. Returns how many jobs fired.
    pub fn run_by_tag(&self, tag: &str) -> AppResult<usize> {
        match self.inner.phase() {
            EnginePhase::Running => {}
            EnginePhase::Idle => {
                return Err(AppError::Conflict(format!(
                    "cannot run '{tag}' before the engine is started"
                )));
            }
            EnginePhase::Stopped => {
                return Err(AppError::Conflict(format!(
                    "cannot run '{tag}' on a stopped engine"
                )));
            }
        }

        let matched: Vec<_> = self
            .inner
            .jobs()
            .into_iter()
            .filter(|job| job.definition.matches_tag(tag))
            .collect();
        if matched.is_empty() {
            return Err(AppError::NotFound(format!("no job tagged '{tag}'")));
        }

        let count = matched.len();
        for job in matched {
            debug!(job = %job.definition.name(), tag, "running job on demand");
            fire(&self.inner, job);
        }

        Ok(count)
    }

    /// Returns snapshots of every job addressed by `tag`.
    #[must_use]
    pub fn find_by_tag(&self, tag: &str) -> Vec<JobSnapshot> {
        self.inner
            .jobs()
            .iter()
            .filter(|job| job.definition.matches_tag(tag))
            .map(|job| job.snapshot())
            .collect()
    }

    /// Returns a snapshot of the job named `name`.
    #[must_use]
    pub fn job(&self, name: &str) -> Option<JobSnapshot> {
        self.inner
            .jobs()
            .iter()
            .find(|job| job.definition.name() == name)
            .map(|job| job.snapshot())
    }

    /// Returns the next scheduled trigger of the job named `name`.
    #[must_use]
    pub fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.job(name).and_then(|job| job.next_run)
    }

    /// Returns snapshots of all jobs in registration order.
    #[must_use]
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.inner.jobs().iter().map(|job| job.snapshot()).collect()
    }

    /// Returns the number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns true when no job is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true between start and stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.phase() == EnginePhase::Running
    }
}

async fn dispatch(inner: Arc<EngineInner>) {
    loop {
        let now = Utc::now();
        let mut earliest: Option<DateTime<Utc>> = None;

        for job in inner.jobs() {
            let (due, next_run) = {
                let mut status = job.status();
                let due = status.next_run.is_some_and(|next_run| next_run <= now);
                if due {
                    status.next_run = job.schedule.next_after_in(now, inner.zone);
                }
                (due, status.next_run)
            };

            if due {
                fire(&inner, job);
            }
            if let Some(next_run) = next_run {
                earliest = Some(earliest.map_or(next_run, |current| current.min(next_run)));
            }
        }

        let wait = earliest.map_or(IDLE_WAIT, |at| {
            (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
        });

        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wakeup.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!("cron dispatcher exited");
}

fn fire(inner: &Arc<EngineInner>, job: Arc<ScheduledJob>) {
    {
        let mut status = job.status();
        status.in_flight += 1;
        status.state = JobState::Running;
    }

    tokio::spawn(execute(Arc::clone(inner), job));
}

async fn execute(inner: Arc<EngineInner>, job: Arc<ScheduledJob>) {
    let info = job.definition.info();
    let log_execution = job.definition.log_execution();

    for hook in inner.pre_hooks() {
        run_hook(&info, "pre-execution", || hook(&info));
    }

    if log_execution {
        info!(job = %info.name, "job started");
    }

    let runner = Arc::clone(&job.runner);
    let started = Instant::now();
    let outcome = match tokio::spawn(async move { runner().await }).await {
        Ok(Ok(())) => JobOutcome::Succeeded,
        Ok(Err(error)) => JobOutcome::Failed {
            error: error.to_string(),
        },
        Err(join_error) if join_error.is_panic() => JobOutcome::Panicked {
            message: panic_message(join_error.into_panic()),
        },
        Err(join_error) => JobOutcome::Failed {
            error: join_error.to_string(),
        },
    };
    let stats = JobExecStats {
        took: started.elapsed(),
        outcome,
    };

    let next_run = {
        let mut status = job.status();
        status.in_flight = status.in_flight.saturating_sub(1);
        if status.in_flight == 0 {
            status.state = inner.phase().resting_job_state();
        }
        status.next_run
    };

    let took_ms = stats.took.as_millis();
    match &stats.outcome {
        JobOutcome::Succeeded if log_execution => {
            info!(job = %info.name, took_ms, next_run = ?next_run, "job finished");
        }
        JobOutcome::Succeeded => {}
        JobOutcome::Failed { error } => {
            error!(job = %info.name, took_ms, error = %error, "job failed");
        }
        JobOutcome::Panicked { message } => {
            error!(job = %info.name, took_ms, error = %message, "job panicked");
        }
    }

    for hook in inner.post_hooks() {
        run_hook(&info, "post-execution", || hook(&info, &stats));
    }
}

// Hooks run on the job's task; a panic there must not skip the bookkeeping.
fn run_hook(info: &JobInfo, stage: &'static str, call: impl FnOnce() -> AppResult<()>) {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(job = %info.name, stage, error = %error, "job hook failed"),
        Err(payload) => {
            warn!(job = %info.name, stage, error = %panic_message(payload), "job hook panicked");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "panic without message".to_owned()
}
