use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cadence_core::AppResult;
use cadence_domain::NodeId;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{KeyValueStore, LeaderConfig};

struct RenewalTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Renewals {
    tasks: HashMap<String, RenewalTask>,
    // Groups this node gave up, with the lease left on a late record.
    closed: HashMap<String, Duration>,
}

/// Per-group leader election over a single store key.
///
/// Each attempt is one non-blocking set-if-absent; callers poll on their own
/// cadence. While a group is led, a background task refreshes the record.
/// Once this node releases or steps down from a group, the group stays
/// closed for this elector: later attempts lose and never restart renewal.
pub struct LeaderElector {
    store: Arc<dyn KeyValueStore>,
    node_id: NodeId,
    config: LeaderConfig,
    renewals: Mutex<Renewals>,
}

impl LeaderElector {
    /// Creates an elector for one node.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, node_id: NodeId, config: LeaderConfig) -> Self {
        Self {
            store,
            node_id,
            config,
            renewals: Mutex::new(Renewals::default()),
        }
    }

    /// Returns the value this node writes into leader records.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Returns lease settings.
    #[must_use]
    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    /// Returns the store key for `group`.
    #[must_use]
    pub fn leader_key(&self, group: &str) -> String {
        self.config.key_for(group)
    }

    /// Makes one election attempt for `group`.
    ///
    /// Store failures count as "not leader" for this attempt, and so does
    /// a group this node already gave up.
    pub async fn try_become_leader(&self, group: &str) -> bool {
        if self.is_closed(group) {
            return false;
        }
        let key = self.leader_key(group);

        let current = self.store.get(key.as_str()).await;
        match current {
            Ok(Some(holder)) if holder == self.node_id.as_str() => {
                return self.ensure_renewal(group, key);
            }
            Ok(_) => {}
            Err(error) => {
                warn!(group, error = %error, "failed to read leader record");
                return false;
            }
        }

        match self
            .store
            .set_if_absent(key.as_str(), self.node_id.as_str(), self.config.lease_ttl)
            .await
        {
            Ok(true) => {
                if !self.ensure_renewal(group, key.clone()) {
                    self.lapse_late_record(group, key.as_str()).await;
                    return false;
                }
                info!(group, node_id = %self.node_id, "elected leader");
                true
            }
            Ok(false) => {
                self.stop_renewal(group).await;
                false
            }
            Err(error) => {
                warn!(group, error = %error, "leader election attempt failed");
                false
            }
        }
    }

    /// Reports whether the stored leader for `group` is this node.
    pub async fn is_leader(&self, group: &str) -> bool {
        match self.store.get(self.leader_key(group).as_str()).await {
            Ok(holder) => holder.as_deref() == Some(self.node_id.as_str()),
            Err(error) => {
                warn!(group, error = %error, "failed to read leader record");
                false
            }
        }
    }

    /// Gives up leadership of `group`.
    ///
    /// Renewal stops first. The record is deleted only while it still holds
    /// this node's id; returns whether a record was deleted. The group is
    /// closed for this elector afterwards.
    pub async fn release_leadership(&self, group: &str) -> AppResult<bool> {
        self.close(group, Duration::ZERO).await;

        let released = self
            .store
            .compare_and_delete(self.leader_key(group).as_str(), self.node_id.as_str())
            .await?;
        if released {
            info!(group, node_id = %self.node_id, "released leadership");
        }

        Ok(released)
    }

    /// Stops renewal and lets the record lapse within `grace`.
    ///
    /// Shortening instead of deleting leaves the record readable until it
    /// expires. Records held by other nodes are not touched. The group is
    /// closed for this elector afterwards.
    pub async fn step_down(&self, group: &str, grace: Duration) -> AppResult<bool> {
        self.close(group, grace).await;

        let shortened = self
            .store
            .extend_ttl(
                self.leader_key(group).as_str(),
                self.node_id.as_str(),
                grace,
            )
            .await?;
        if shortened {
            info!(
                group,
                node_id = %self.node_id,
                grace_ms = grace.as_millis(),
                "stepping down as leader"
            );
        }

        Ok(shortened)
    }

    /// Returns true while a renewal task is active for `group`.
    #[must_use]
    pub fn is_renewing(&self, group: &str) -> bool {
        self.renewals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .get(group)
            .is_some_and(|task| !task.cancel.is_cancelled())
    }

    /// Returns true once this node released or stepped down from `group`.
    #[must_use]
    pub fn is_closed(&self, group: &str) -> bool {
        self.renewals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .contains_key(group)
    }

    /// Stops the renewal task for `group` and waits for it to exit.
    pub async fn stop_renewal(&self, group: &str) {
        let task = self
            .renewals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tasks
            .remove(group);
        join_renewal(group, task).await;
    }

    async fn close(&self, group: &str, grace: Duration) {
        let task = {
            let mut renewals = self.renewals.lock().unwrap_or_else(PoisonError::into_inner);
            renewals.closed.insert(group.to_owned(), grace);
            renewals.tasks.remove(group)
        };
        join_renewal(group, task).await;
    }

    // A record written by an attempt that raced with close().
    async fn lapse_late_record(&self, group: &str, key: &str) {
        let grace = self
            .renewals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
            .get(group)
            .copied()
            .unwrap_or_default();

        let result = if grace.is_zero() {
            self.store.compare_and_delete(key, self.node_id.as_str()).await
        } else {
            self.store.extend_ttl(key, self.node_id.as_str(), grace).await
        };
        match result {
            Ok(_) => debug!(group, "dropped leader record written after close"),
            Err(error) => warn!(group, error = %error, "failed to drop late leader record"),
        }
    }

    fn ensure_renewal(&self, group: &str, key: String) -> bool {
        let mut renewals = self.renewals.lock().unwrap_or_else(PoisonError::into_inner);
        if renewals.closed.contains_key(group) {
            debug!(group, "group closed, not renewing");
            return false;
        }
        if renewals
            .tasks
            .get(group)
            .is_some_and(|task| !task.cancel.is_cancelled())
        {
            return true;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(renew_leadership(
            Arc::clone(&self.store),
            LeaderLease {
                group: group.to_owned(),
                key,
                node_id: self.node_id.clone(),
                lease_ttl: self.config.lease_ttl,
                renew_interval: self.config.renew_interval,
            },
            cancel.clone(),
        ));

        renewals
            .tasks
            .insert(group.to_owned(), RenewalTask { cancel, handle });
        true
    }
}

async fn join_renewal(group: &str, task: Option<RenewalTask>) {
    if let Some(task) = task {
        task.cancel.cancel();
        if let Err(error) = task.handle.await {
            warn!(group, error = %error, "leader renewal task ended abnormally");
        }
        debug!(group, "stopped leader renewal");
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        let renewals = self
            .renewals
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for task in renewals.tasks.values() {
            task.cancel.cancel();
        }
    }
}

struct LeaderLease {
    group: String,
    key: String,
    node_id: NodeId,
    lease_ttl: Duration,
    renew_interval: Duration,
}

async fn renew_leadership(
    store: Arc<dyn KeyValueStore>,
    lease: LeaderLease,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + lease.renew_interval,
        lease.renew_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store
            .extend_ttl(
                lease.key.as_str(),
                lease.node_id.as_str(),
                lease.lease_ttl,
            )
            .await
        {
            Ok(true) => debug!(group = %lease.group, "renewed leader lease"),
            Ok(false) => {
                warn!(
                    group = %lease.group,
                    node_id = %lease.node_id,
                    "leadership lost, stopping renewal"
                );
                cancel.cancel();
                return;
            }
            Err(error) => {
                warn!(group = %lease.group, error = %error, "failed to renew leader lease");
            }
        }
    }
}
