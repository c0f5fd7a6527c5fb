use std::sync::Arc;
use std::time::Duration;

use cadence_core::AppError;
use cadence_domain::LockState;

use crate::test_support::FakeKeyValueStore;
use crate::{KeyValueStore, LockConfig};

use super::DistributedMutex;

fn build_mutex() -> (Arc<FakeKeyValueStore>, DistributedMutex) {
    let store = Arc::new(FakeKeyValueStore::default());
    let shared: Arc<dyn KeyValueStore> = store.clone();
    (store, DistributedMutex::new(shared, LockConfig::default()))
}

#[tokio::test(start_paused = true)]
async fn lock_on_free_key_stores_fencing_token() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    assert_eq!(handle.key(), "res-1");
    assert_eq!(handle.state().await, LockState::Locked);
    assert_eq!(
        store.value("res-1").await.as_deref(),
        Some(handle.token().as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn lock_rejects_empty_key() {
    let (_store, mutex) = build_mutex();

    let result = mutex.lock("  ").await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[tokio::test(start_paused = true)]
async fn lock_reports_contention_after_backoff_budget() {
    let (store, mutex) = build_mutex();
    store
        .overwrite("res-1", "other-holder", Duration::from_secs(60))
        .await;

    let config = LockConfig {
        backoff_steps: 3,
        ..LockConfig::default()
    };
    let started = tokio::time::Instant::now();
    let result = mutex.lock_with("res-1", config).await;

    assert!(matches!(&result, Err(error) if error.is_contention()));
    assert_eq!(started.elapsed(), Duration::from_millis(15));
    assert_eq!(store.value("res-1").await.as_deref(), Some("other-holder"));
}

#[tokio::test(start_paused = true)]
async fn waiting_contender_acquires_after_holder_unlocks() {
    let (_store, mutex) = build_mutex();

    let holder = mutex.lock("res-1").await;
    assert!(holder.is_ok());
    let holder = holder.unwrap_or_else(|_| unreachable!());
    let holder_token = holder.token().clone();

    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        holder.unlock().await
    });

    let contender = mutex.lock("res-1").await;
    assert!(contender.is_ok());
    let contender = contender.unwrap_or_else(|_| unreachable!());
    assert_ne!(contender.token(), &holder_token);

    let released = release.await;
    assert!(matches!(released, Ok(Ok(()))));
}

#[tokio::test(start_paused = true)]
async fn concurrent_lock_calls_admit_exactly_one_holder() {
    let (store, mutex) = build_mutex();

    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let mutex = mutex.clone();
            tokio::spawn(async move { mutex.lock("res-1").await })
        })
        .collect();
    let mut holders = Vec::new();
    let mut contended = 0;
    for attempt in attempts {
        match attempt.await {
            Ok(Ok(handle)) => holders.push(handle),
            Ok(Err(error)) if error.is_contention() => contended += 1,
            other => panic!("unexpected lock result: {:?}", other.map(|result| result.err())),
        }
    }

    assert_eq!(holders.len(), 1);
    assert_eq!(contended, 4);
    assert_eq!(
        store.value("res-1").await.as_deref(),
        Some(holders[0].token().as_str())
    );
    assert!(holders[0].unlock().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn long_holder_outlasts_a_contenders_budget() {
    let (store, mutex) = build_mutex();

    let holder = mutex.lock("res-1").await;
    assert!(holder.is_ok());
    let holder = holder.unwrap_or_else(|_| unreachable!());
    let holder_token = holder.token().clone();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        holder.unlock().await
    });

    let started = tokio::time::Instant::now();
    let contender = mutex.lock("res-1").await;
    assert!(matches!(&contender, Err(error) if error.is_contention()));
    assert_eq!(started.elapsed(), LockConfig::default().max_wait());
    assert_eq!(
        store.value("res-1").await.as_deref(),
        Some(holder_token.as_str())
    );

    assert!(matches!(release.await, Ok(Ok(()))));
    let retry = mutex.lock("res-1").await;
    assert!(retry.is_ok());
    assert_eq!(started.elapsed(), Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn unlock_is_idempotent() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    assert!(handle.unlock().await.is_ok());
    assert!(handle.unlock().await.is_ok());
    assert_eq!(handle.state().await, LockState::Released);
    assert_eq!(store.value("res-1").await, None);
}

#[tokio::test(start_paused = true)]
async fn unlock_never_deletes_another_holders_record() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    store
        .overwrite("res-1", "new-holder", Duration::from_secs(30))
        .await;

    assert!(handle.unlock().await.is_ok());
    assert_eq!(store.value("res-1").await.as_deref(), Some("new-holder"));
}

#[tokio::test(start_paused = true)]
async fn renewal_keeps_lease_alive_beyond_ttl() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    tokio::time::sleep(Duration::from_secs(90)).await;

    assert_eq!(handle.state().await, LockState::Locked);
    assert_eq!(
        store.value("res-1").await.as_deref(),
        Some(handle.token().as_str())
    );

    assert!(handle.unlock().await.is_ok());
    assert_eq!(store.value("res-1").await, None);
}

#[tokio::test(start_paused = true)]
async fn lease_without_renewal_expires_after_ttl() {
    let (store, mutex) = build_mutex();

    let handle = mutex
        .lock_with("res-1", LockConfig::default().without_renewal())
        .await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(store.value("res-1").await, None);

    let other = mutex.lock("res-1").await;
    assert!(other.is_ok());
    assert!(handle.unlock().await.is_ok());
    assert!(store.value("res-1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn dropping_handle_stops_renewal() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    drop(handle);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(store.value("res-1").await, None);
}

#[tokio::test(start_paused = true)]
async fn lock_surfaces_store_outage() {
    let (store, mutex) = build_mutex();
    store.set_unavailable(true);

    let result = mutex.lock("res-1").await;
    assert!(matches!(result, Err(AppError::Unavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn transient_renewal_failure_keeps_lock() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    store.set_unavailable(true);
    tokio::time::sleep(Duration::from_secs(15)).await;
    store.set_unavailable(false);
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(handle.state().await, LockState::Locked);
    let remaining = store.remaining_ttl("res-1").await;
    assert!(remaining.is_some_and(|ttl| ttl > Duration::from_secs(20)));
}

#[tokio::test(start_paused = true)]
async fn renewal_mismatch_marks_lock_unlocked() {
    let (store, mutex) = build_mutex();

    let handle = mutex.lock("res-1").await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());

    store
        .overwrite("res-1", "new-holder", Duration::from_secs(30))
        .await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(handle.state().await, LockState::Unlocked);
    assert!(handle.unlock().await.is_ok());
    assert_eq!(store.value("res-1").await.as_deref(), Some("new-holder"));
}

#[tokio::test(start_paused = true)]
async fn run_locked_releases_after_work() {
    let (store, mutex) = build_mutex();
    let observer = Arc::clone(&store);

    let result = mutex
        .run_locked("res-1", || async move {
            let held = observer.value("res-1").await;
            Ok(held.is_some())
        })
        .await;

    assert!(matches!(result, Ok(true)));
    assert_eq!(store.value("res-1").await, None);
}

#[tokio::test(start_paused = true)]
async fn run_locked_skips_work_under_contention() {
    let (store, mutex) = build_mutex();
    store
        .overwrite("res-1", "other-holder", Duration::from_secs(60))
        .await;

    let result = mutex.run_locked("res-1", || async { Ok(()) }).await;

    assert!(matches!(&result, Err(error) if error.is_contention()));
    assert_eq!(store.value("res-1").await.as_deref(), Some("other-holder"));
}
