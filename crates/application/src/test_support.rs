use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::{AppError, AppResult};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::KeyValueStore;

#[derive(Debug, Clone)]
struct FakeEntry {
    value: String,
    expires_at: Instant,
}

/// Store fake with TTLs on tokio's clock, so paused-time tests can expire leases.
#[derive(Default)]
pub(crate) struct FakeKeyValueStore {
    entries: Mutex<HashMap<String, FakeEntry>>,
    unavailable: AtomicBool,
    get_delay_ms: AtomicU64,
}

impl FakeKeyValueStore {
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every `get` wait `delay` before reading.
    pub(crate) fn set_get_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.get_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub(crate) async fn overwrite(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().await.insert(
            key.to_owned(),
            FakeEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub(crate) async fn value(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub(crate) async fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .map(|entry| entry.expires_at.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("fake store offline".to_owned()));
        }
        Ok(())
    }
}

fn live_value<'a>(entries: &'a HashMap<String, FakeEntry>, key: &str) -> Option<&'a str> {
    entries
        .get(key)
        .filter(|entry| entry.expires_at > Instant::now())
        .map(|entry| entry.value.as_str())
}

#[async_trait]
impl KeyValueStore for FakeKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if live_value(&entries, key).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_owned(),
            FakeEntry {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.check_available()?;
        let delay = self.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let entries = self.entries.lock().await;
        Ok(live_value(&entries, key).map(str::to_owned))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if live_value(&entries, key) != Some(expected) {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }

    async fn extend_ttl(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        if live_value(&entries, key) != Some(expected) {
            return Ok(false);
        }

        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Instant::now() + ttl;
        }
        Ok(true)
    }
}
