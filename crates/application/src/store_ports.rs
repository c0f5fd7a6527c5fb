use std::time::Duration;

use async_trait::async_trait;
use cadence_core::AppResult;

/// Shared key-value store port backing locks and leader records.
///
/// Every operation must be atomic on the store side. Implementations are
/// expected to reuse one long-lived client across calls.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Stores `value` under `key` with `ttl` only when the key is absent.
    ///
    /// Returns false when another value already occupies the key.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Reads the current value, if any.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Deletes `key` only when it currently holds `expected`.
    ///
    /// Returns false and leaves the record untouched on mismatch.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Resets the TTL of `key` to `ttl` only when it currently holds `expected`.
    ///
    /// Returns false when the value no longer matches or the key expired.
    async fn extend_ttl(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool>;
}
