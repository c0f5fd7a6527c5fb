use std::fmt::{Display, Formatter};
use std::time::Duration;

use cadence_core::{AppResult, NonEmptyString};
use serde::{Deserialize, Serialize};

use crate::CronSchedule;

/// Registration-time description of one cron job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    name: NonEmptyString,
    expression: String,
    includes_seconds: bool,
    tags: Vec<String>,
    trigger_on_bootstrap: bool,
    log_execution: bool,
}

impl JobDefinition {
    /// Creates a job definition with a unique name and a cron expression.
    ///
    /// The expression is validated when the job is registered with an engine.
    pub fn new(
        name: impl Into<String>,
        expression: impl Into<String>,
        includes_seconds: bool,
    ) -> AppResult<Self> {
        Ok(Self {
            name: NonEmptyString::new(name)?,
            expression: expression.into(),
            includes_seconds,
            tags: Vec::new(),
            trigger_on_bootstrap: false,
            log_execution: true,
        })
    }

    /// Adds one extra tag the job can be addressed by.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.trim().is_empty() && !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Fires the job once as soon as the engine starts.
    #[must_use]
    pub fn with_trigger_on_bootstrap(mut self, enabled: bool) -> Self {
        self.trigger_on_bootstrap = enabled;
        self
    }

    /// Toggles info-level start/finish logs. Failures are always logged.
    #[must_use]
    pub fn with_execution_log(mut self, enabled: bool) -> Self {
        self.log_execution = enabled;
        self
    }

    /// Returns the unique job name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Returns the raw cron expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        self.expression.as_str()
    }

    /// Returns whether the expression carries a seconds field.
    #[must_use]
    pub fn includes_seconds(&self) -> bool {
        self.includes_seconds
    }

    /// Returns the extra tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        self.tags.as_slice()
    }

    /// Returns whether the job fires once on engine start.
    #[must_use]
    pub fn trigger_on_bootstrap(&self) -> bool {
        self.trigger_on_bootstrap
    }

    /// Returns whether executions are logged at info level.
    #[must_use]
    pub fn log_execution(&self) -> bool {
        self.log_execution
    }

    /// Returns true when the job is addressed by `tag`, either by name or by tag.
    #[must_use]
    pub fn matches_tag(&self, tag: &str) -> bool {
        self.name.as_str() == tag || self.tags.iter().any(|candidate| candidate == tag)
    }

    /// Parses the cron expression.
    pub fn schedule(&self) -> AppResult<CronSchedule> {
        CronSchedule::parse(self.expression.as_str(), self.includes_seconds)
    }

    /// Returns the view of this job handed to execution hooks.
    #[must_use]
    pub fn info(&self) -> JobInfo {
        JobInfo {
            name: self.name.as_str().to_owned(),
            expression: self.expression.clone(),
            includes_seconds: self.includes_seconds,
        }
    }
}

/// Job metadata passed to pre- and post-execution hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Unique job name.
    pub name: String,
    /// Cron expression the job was registered with.
    pub expression: String,
    /// Whether the expression carries a seconds field.
    pub includes_seconds: bool,
}

/// Lifecycle of one registered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Registered, engine not started yet.
    Pending,
    /// Armed and waiting for its next trigger.
    Scheduled,
    /// At least one invocation is in flight.
    Running,
    /// Engine stopped; no further triggers.
    Stopped,
}

impl JobState {
    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Result of one job invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    /// The body returned successfully.
    Succeeded,
    /// The body returned an error.
    Failed {
        /// Rendered error.
        error: String,
    },
    /// The body panicked; the panic was contained.
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl JobOutcome {
    /// Returns true for successful invocations.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns the failure description, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Succeeded => None,
            Self::Failed { error } => Some(error.as_str()),
            Self::Panicked { message } => Some(message.as_str()),
        }
    }
}

/// Timing and outcome of one job invocation, handed to post-execution hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecStats {
    /// Wall time spent in the job body.
    pub took: Duration,
    /// How the body finished.
    pub outcome: JobOutcome,
}
