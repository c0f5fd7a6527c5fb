//! Distributed mutual exclusion over a shared key-value store.
//!
//! Exclusivity comes from the store's atomic set-if-absent; a lock never
//! coordinates with other processes directly. Every acquisition mints a
//! fresh fencing token, and only that token may renew or release the lease.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::{AppError, AppResult, NonEmptyString};
use cadence_domain::{LeaseToken, LockState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{KeyValueStore, LockConfig};

/// Acquires named leases with bounded linear backoff.
#[derive(Clone)]
pub struct DistributedMutex {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
}

impl DistributedMutex {
    /// Creates a mutex service sharing one store client.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Returns the default lock settings.
    #[must_use]
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquires `key` with the default settings.
    ///
    /// Returns [`AppError::Contention`] when the backoff budget runs out.
    pub async fn lock(&self, key: &str) -> AppResult<LockHandle> {
        self.lock_with(key, self.config).await
    }

    /// Acquires `key` with explicit settings.
    pub async fn lock_with(&self, key: &str, config: LockConfig) -> AppResult<LockHandle> {
        let key = NonEmptyString::new(key)
            .map_err(|_| AppError::Validation("lock key must not be empty".to_owned()))?;
        config.validate()?;

        let token = LeaseToken::new();
        let mut retries = 0_u32;

        loop {
            let acquired = self
                .store
                .set_if_absent(key.as_str(), token.as_str(), config.lease_ttl)
                .await?;
            if acquired {
                break;
            }

            if retries >= config.backoff_steps {
                debug!(key = %key, retries, "lock still held, giving up");
                return Err(AppError::Contention(format!(
                    "key '{key}' still held after {retries} retries"
                )));
            }

            retries += 1;
            tokio::time::sleep(config.backoff_window).await;
        }

        debug!(key = %key, retries, "obtained lock");
        Ok(LockHandle::start(
            Arc::clone(&self.store),
            key,
            token,
            config,
        ))
    }

    /// Runs `work` while holding `key`, releasing the lock afterwards.
    pub async fn run_locked<T, F, Fut>(&self, key: &str, work: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let handle = self.lock(key).await.map_err(|error| match error {
            AppError::Contention(_) => error,
            other => AppError::Internal(format!("failed to obtain lock '{key}': {other}")),
        })?;

        let result = work().await;
        if let Err(error) = handle.unlock().await {
            warn!(key = %key, error = %error, "failed to release lock after locked run");
        }

        result
    }
}

/// Ownership of one acquired lease.
///
/// Dropping a held handle stops renewal; the lease then expires on its own.
pub struct LockHandle {
    key: NonEmptyString,
    token: LeaseToken,
    store: Arc<dyn KeyValueStore>,
    state: Arc<Mutex<LockState>>,
    cancel: CancellationToken,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl LockHandle {
    fn start(
        store: Arc<dyn KeyValueStore>,
        key: NonEmptyString,
        token: LeaseToken,
        config: LockConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(LockState::Locked));
        let cancel = CancellationToken::new();

        let renewal = config.refresh_interval.map(|refresh_interval| {
            tokio::spawn(renew_lease(
                LeaseRenewal {
                    store: Arc::clone(&store),
                    key: key.clone(),
                    token: token.clone(),
                    lease_ttl: config.lease_ttl,
                    refresh_interval,
                },
                Arc::clone(&state),
                cancel.clone(),
            ))
        });

        Self {
            key,
            token,
            store,
            state,
            cancel,
            renewal: Mutex::new(renewal),
        }
    }

    /// Returns the locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Returns the fencing token of this acquisition.
    #[must_use]
    pub fn token(&self) -> &LeaseToken {
        &self.token
    }

    /// Returns the current ownership state.
    pub async fn state(&self) -> LockState {
        *self.state.lock().await
    }

    /// Releases the lease.
    ///
    /// Idempotent: calls on a released or lost lock are no-ops. Renewal is
    /// stopped before the store is touched, and the delete only succeeds
    /// while the stored value still equals this handle's token.
    pub async fn unlock(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state != LockState::Locked {
                self.cancel.cancel();
                return Ok(());
            }
            *state = LockState::Released;
        }

        self.cancel.cancel();
        let renewal = self.renewal.lock().await.take();
        if let Some(renewal) = renewal
            && let Err(error) = renewal.await
        {
            warn!(key = %self.key, error = %error, "lock renewal task ended abnormally");
        }

        match self
            .store
            .compare_and_delete(self.key.as_str(), self.token.as_str())
            .await
        {
            Ok(true) => debug!(key = %self.key, "released lock"),
            Ok(false) => info!(key = %self.key, "lock lease already lost, nothing to release"),
            Err(error) => {
                error!(key = %self.key, error = %error, "failed to release lock");
                return Err(error);
            }
        }

        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct LeaseRenewal {
    store: Arc<dyn KeyValueStore>,
    key: NonEmptyString,
    token: LeaseToken,
    lease_ttl: Duration,
    refresh_interval: Duration,
}

async fn renew_lease(
    renewal: LeaseRenewal,
    state: Arc<Mutex<LockState>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + renewal.refresh_interval,
        renewal.refresh_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(key = %renewal.key, "lock renewal cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        match renewal
            .store
            .extend_ttl(
                renewal.key.as_str(),
                renewal.token.as_str(),
                renewal.lease_ttl,
            )
            .await
        {
            Ok(true) => debug!(key = %renewal.key, "refreshed lock lease"),
            Ok(false) => {
                warn!(
                    key = %renewal.key,
                    "lock lease lost to expiry or another holder, stopping renewal"
                );
                let mut state = state.lock().await;
                if *state == LockState::Locked {
                    *state = LockState::Unlocked;
                }
                return;
            }
            Err(error) => {
                warn!(key = %renewal.key, error = %error, "failed to refresh lock lease");
            }
        }
    }
}

#[cfg(test)]
mod tests;
