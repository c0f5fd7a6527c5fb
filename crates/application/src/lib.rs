//! Application services and ports.

#![forbid(unsafe_code)]

mod coordination_config;
mod cron_engine;
mod leader_service;
mod lock_service;
mod schedule_coordinator;
mod store_ports;

#[cfg(test)]
mod test_support;

pub use coordination_config::{
    DEFAULT_SCHEDULE_GROUP, LeaderConfig, LockConfig, SchedulingConfig,
};
pub use cron_engine::{
    CronEngine, JobFuture, JobRunner, JobSnapshot, PostJobHook, PreJobHook, job_runner,
    post_job_hook, pre_job_hook,
};
pub use leader_service::LeaderElector;
pub use lock_service::{DistributedMutex, LockHandle};
pub use schedule_coordinator::ScheduleCoordinator;
pub use store_ports::KeyValueStore;
