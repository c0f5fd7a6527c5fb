use std::time::Duration;

use cadence_application::{LeaderConfig, LockConfig, SchedulingConfig};
use cadence_core::{AppError, AppResult};
use cadence_domain::ScheduleZone;

/// Runtime configuration of the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Redis connection string; `None` runs against a process-local store.
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub scheduling: SchedulingConfig,
    pub lock: LockConfig,
    pub leader: LeaderConfig,
    pub schedule_zone: ScheduleZone,
    pub heartbeat_cron: String,
    pub compaction_cron: String,
}

impl WorkerConfig {
    /// Loads configuration from process environment variables.
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let env = EnvReader { lookup };

        let redis_url = env.optional("REDIS_URL");
        let redis_key_prefix = env
            .optional("REDIS_KEY_PREFIX")
            .unwrap_or_else(|| "cadence".to_owned());

        let app_name = env
            .optional("APP_NAME")
            .unwrap_or_else(|| "cadence-worker".to_owned());
        let scheduling = SchedulingConfig {
            app_name: Some(app_name),
            group: env.optional("TASK_SCHEDULING_GROUP"),
            enabled: env.parse_bool("TASK_SCHEDULING_ENABLED", true)?,
        };

        let lock = LockConfig {
            lease_ttl: Duration::from_millis(env.parse_u64("LOCK_LEASE_TTL_MS", 30_000)?),
            refresh_interval: Some(Duration::from_millis(
                env.parse_u64("LOCK_REFRESH_INTERVAL_MS", 10_000)?,
            )),
            backoff_window: Duration::from_millis(env.parse_u64("LOCK_BACKOFF_WINDOW_MS", 5)?),
            backoff_steps: env.parse_u32("LOCK_BACKOFF_STEPS", 200)?,
        };
        lock.validate()?;

        let leader = LeaderConfig {
            lease_ttl: Duration::from_secs(env.parse_u64("LEADER_LEASE_TTL_SECONDS", 60)?),
            renew_interval: Duration::from_secs(
                env.parse_u64("LEADER_RENEW_INTERVAL_SECONDS", 5)?,
            ),
            ..LeaderConfig::default()
        };
        leader.validate()?;

        let schedule_zone = match env.optional("CRON_TIME_ZONE") {
            Some(value) => ScheduleZone::parse(value.as_str())?,
            None => ScheduleZone::Utc,
        };

        let heartbeat_cron = env
            .optional("WORKER_HEARTBEAT_CRON")
            .unwrap_or_else(|| "*/15 * * * * *".to_owned());
        let compaction_cron = env
            .optional("WORKER_COMPACTION_CRON")
            .unwrap_or_else(|| "0 */5 * * * *".to_owned());

        Ok(Self {
            redis_url,
            redis_key_prefix,
            scheduling,
            lock,
            leader,
            schedule_zone,
            heartbeat_cron,
            compaction_cron,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn parse_u64(&self, name: &str, default: u64) -> AppResult<u64> {
        match self.optional(name) {
            Some(value) => value.parse::<u64>().map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
            None => Ok(default),
        }
    }

    fn parse_u32(&self, name: &str, default: u32) -> AppResult<u32> {
        match self.optional(name) {
            Some(value) => value.parse::<u32>().map_err(|error| {
                AppError::Validation(format!("invalid {name} value '{value}': {error}"))
            }),
            None => Ok(default),
        }
    }

    fn parse_bool(&self, name: &str, default: bool) -> AppResult<bool> {
        match self.optional(name) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(AppError::Validation(format!(
                    "invalid {name} value '{value}': expected a boolean"
                ))),
            },
            None => Ok(default),
        }
    }
}
