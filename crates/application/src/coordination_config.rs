use std::time::Duration;

use cadence_core::{AppError, AppResult};

/// Group used when neither a group nor an application name is configured.
pub const DEFAULT_SCHEDULE_GROUP: &str = "default";

/// Lease and backoff settings for [`crate::DistributedMutex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// TTL written with every acquisition and renewal.
    pub lease_ttl: Duration,
    /// Renewal cadence; `None` disables the renewal task.
    pub refresh_interval: Option<Duration>,
    /// Fixed wait between acquisition attempts.
    pub backoff_window: Duration,
    /// Number of retries after the first attempt.
    pub backoff_steps: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            refresh_interval: Some(Duration::from_secs(10)),
            backoff_window: Duration::from_millis(5),
            backoff_steps: 200,
        }
    }
}

impl LockConfig {
    /// Derives the step count from a desired maximum wait.
    ///
    /// Steps are `wait / backoff_window`, floored. Waits not longer than one
    /// window keep the current step count.
    #[must_use]
    pub fn with_backoff_duration(mut self, wait: Duration) -> Self {
        if wait > self.backoff_window && !self.backoff_window.is_zero() {
            let steps = wait.as_nanos() / self.backoff_window.as_nanos();
            self.backoff_steps = u32::try_from(steps).unwrap_or(u32::MAX);
        }
        self
    }

    /// Disables lease renewal; the lease expires `lease_ttl` after acquisition.
    #[must_use]
    pub fn without_renewal(mut self) -> Self {
        self.refresh_interval = None;
        self
    }

    /// Returns the approximate longest time `lock` may wait.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.backoff_window.saturating_mul(self.backoff_steps)
    }

    /// Checks lease and backoff invariants.
    pub fn validate(&self) -> AppResult<()> {
        if self.lease_ttl.is_zero() {
            return Err(AppError::Validation(
                "lock lease_ttl must be greater than zero".to_owned(),
            ));
        }

        if self.backoff_window.is_zero() {
            return Err(AppError::Validation(
                "lock backoff_window must be greater than zero".to_owned(),
            ));
        }

        if let Some(refresh_interval) = self.refresh_interval
            && (refresh_interval.is_zero() || refresh_interval >= self.lease_ttl)
        {
            return Err(AppError::Validation(format!(
                "lock refresh_interval ({refresh_interval:?}) must be between zero and lease_ttl ({:?})",
                self.lease_ttl
            )));
        }

        Ok(())
    }
}

/// Lease settings for [`crate::LeaderElector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderConfig {
    /// TTL of the leader record.
    pub lease_ttl: Duration,
    /// Renewal cadence while leading.
    pub renew_interval: Duration,
    /// Remaining lease left in place when a leader shuts down.
    pub step_down_grace: Duration,
    /// Prefix joined with the group name to form the leader key.
    pub key_prefix: String,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(5),
            step_down_grace: Duration::from_secs(1),
            key_prefix: "task:master:group:".to_owned(),
        }
    }
}

impl LeaderConfig {
    /// Returns the store key of the leader record for `group`.
    #[must_use]
    pub fn key_for(&self, group: &str) -> String {
        format!("{}{group}", self.key_prefix)
    }

    /// Checks lease invariants.
    pub fn validate(&self) -> AppResult<()> {
        if self.lease_ttl.is_zero() {
            return Err(AppError::Validation(
                "leader lease_ttl must be greater than zero".to_owned(),
            ));
        }

        if self.renew_interval.is_zero() || self.renew_interval >= self.lease_ttl {
            return Err(AppError::Validation(format!(
                "leader renew_interval ({:?}) must be between zero and lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }

        if self.step_down_grace.is_zero() {
            return Err(AppError::Validation(
                "leader step_down_grace must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Settings for [`crate::ScheduleCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingConfig {
    /// Application name, used as the group when none is set.
    pub app_name: Option<String>,
    /// Explicit coordination group.
    pub group: Option<String>,
    /// When false, scheduled tasks run on every node without election.
    pub enabled: bool,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            app_name: None,
            group: None,
            enabled: true,
        }
    }
}

impl SchedulingConfig {
    /// Resolves the group name: explicit group, then app name, then `default`.
    #[must_use]
    pub fn resolve_group(&self) -> String {
        [self.group.as_deref(), self.app_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or(DEFAULT_SCHEDULE_GROUP)
            .to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{LeaderConfig, LockConfig, SchedulingConfig};

    #[test]
    fn lock_defaults_wait_about_one_second() {
        let config = LockConfig::default();
        assert_eq!(config.max_wait(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn backoff_duration_floors_to_whole_steps() {
        let config = LockConfig::default().with_backoff_duration(Duration::from_millis(3_002));
        assert_eq!(config.backoff_steps, 600);

        let unchanged = LockConfig::default().with_backoff_duration(Duration::from_millis(3));
        assert_eq!(unchanged.backoff_steps, 200);
    }

    #[test]
    fn refresh_interval_must_be_shorter_than_lease() {
        let config = LockConfig {
            refresh_interval: Some(Duration::from_secs(30)),
            ..LockConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(config.without_renewal().validate().is_ok());
    }

    #[test]
    fn leader_key_uses_prefix() {
        let config = LeaderConfig::default();
        assert_eq!(config.key_for("billing"), "task:master:group:billing");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn group_resolution_prefers_group_then_app_name() {
        let explicit = SchedulingConfig {
            app_name: Some("billing".to_owned()),
            group: Some(" nightly ".to_owned()),
            enabled: true,
        };
        assert_eq!(explicit.resolve_group(), "nightly");

        let from_app = SchedulingConfig {
            app_name: Some("billing".to_owned()),
            group: Some("  ".to_owned()),
            enabled: true,
        };
        assert_eq!(from_app.resolve_group(), "billing");

        assert_eq!(SchedulingConfig::default().resolve_group(), "default");
    }
}
