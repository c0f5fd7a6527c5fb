//! Redis-backed key-value store for leases and leader records.

use std::time::Duration;

use async_trait::async_trait;
use cadence_application::KeyValueStore;
use cadence_core::{AppError, AppResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const EXTEND_TTL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Redis implementation of [`KeyValueStore`].
///
/// One managed connection is shared by every clone; it reconnects on its own.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisKeyValueStore {
    /// Connects to Redis and keeps the connection for the store's lifetime.
    pub async fn connect(client: redis::Client, key_prefix: impl Into<String>) -> AppResult<Self> {
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to connect to redis: {error}"))
            })?;
        let key_prefix = key_prefix.into();

        info!(key_prefix = %key_prefix, "connected to redis key-value store");
        Ok(Self {
            connection,
            key_prefix,
        })
    }

    fn key_for(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}:{key}", self.key_prefix)
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut connection = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key_for(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to set lease '{key}': {error}"))
            })?;

        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection.clone();
        connection
            .get::<_, Option<String>>(self.key_for(key))
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to read '{key}': {error}")))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut connection = self.connection.clone();
        let deleted = Script::new(COMPARE_AND_DELETE_SCRIPT)
            .key(self.key_for(key))
            .arg(expected)
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to release lease '{key}': {error}"))
            })?;

        Ok(deleted > 0)
    }

    async fn extend_ttl(&self, key: &str, expected: &str, ttl: Duration) -> AppResult<bool> {
        let mut connection = self.connection.clone();
        let extended = Script::new(EXTEND_TTL_SCRIPT)
            .key(self.key_for(key))
            .arg(expected)
            .arg(ttl_millis(ttl))
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!("failed to extend lease '{key}': {error}"))
            })?;

        Ok(extended > 0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cadence_application::KeyValueStore;
    use cadence_domain::LeaseToken;

    use super::{RedisKeyValueStore, ttl_millis};

    async fn connect_test_store() -> Option<RedisKeyValueStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        let client = redis::Client::open(url).ok()?;
        let prefix = format!("cadence-test:{}", LeaseToken::new());
        RedisKeyValueStore::connect(client, prefix).await.ok()
    }

    #[test]
    fn ttl_is_rounded_up_to_one_millisecond() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
    }

    #[tokio::test]
    async fn set_if_absent_only_writes_free_keys() {
        let Some(store) = connect_test_store().await else {
            return;
        };

        let first = store
            .set_if_absent("res-1", "holder-a", Duration::from_secs(5))
            .await;
        let second = store
            .set_if_absent("res-1", "holder-b", Duration::from_secs(5))
            .await;

        assert!(matches!(first, Ok(true)));
        assert!(matches!(second, Ok(false)));
        let value = store.get("res-1").await;
        assert!(matches!(value.as_ref().map(Option::as_deref), Ok(Some("holder-a"))));

        assert!(matches!(store.compare_and_delete("res-1", "holder-a").await, Ok(true)));
    }

    #[tokio::test]
    async fn fenced_operations_ignore_foreign_values() {
        let Some(store) = connect_test_store().await else {
            return;
        };

        let stored = store
            .set_if_absent("res-1", "holder-a", Duration::from_secs(5))
            .await;
        assert!(matches!(stored, Ok(true)));

        let extended = store
            .extend_ttl("res-1", "holder-b", Duration::from_secs(60))
            .await;
        let deleted = store.compare_and_delete("res-1", "holder-b").await;
        assert!(matches!(extended, Ok(false)));
        assert!(matches!(deleted, Ok(false)));

        let value = store.get("res-1").await;
        assert!(matches!(value.as_ref().map(Option::as_deref), Ok(Some("holder-a"))));

        assert!(matches!(store.compare_and_delete("res-1", "holder-a").await, Ok(true)));
        assert!(matches!(store.get("res-1").await, Ok(None)));
    }

    #[tokio::test]
    async fn extended_lease_survives_its_original_ttl() {
        let Some(store) = connect_test_store().await else {
            return;
        };

        let stored = store
            .set_if_absent("res-1", "holder-a", Duration::from_millis(300))
            .await;
        assert!(matches!(stored, Ok(true)));

        let extended = store
            .extend_ttl("res-1", "holder-a", Duration::from_secs(5))
            .await;
        assert!(matches!(extended, Ok(true)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(store.get("res-1").await, Ok(Some(_))));

        assert!(matches!(store.compare_and_delete("res-1", "holder-a").await, Ok(true)));
    }
}
