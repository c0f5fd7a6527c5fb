//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod job;
mod lease;
mod schedule;

pub use job::{JobDefinition, JobExecStats, JobInfo, JobOutcome, JobState};
pub use lease::{CoordinatorState, LeaseToken, LockState, NodeId};
pub use schedule::{CronSchedule, ScheduleZone};
