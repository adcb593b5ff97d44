//! The connector contract, exercised identically against every backend.
//!
//! The in-memory backend always runs. The networked backends are written
//! against the same contract functions but ignored by default; point the
//! matching environment variable at a live server and run with
//! `cargo test -- --ignored` to exercise them:
//!
//! - `TASKMILL_REDIS_URL` (e.g. `redis://127.0.0.1:6379`)
//! - `TASKMILL_MONGO_URI` (e.g. `mongodb://127.0.0.1:27017`)
//! - `TASKMILL_POSTGRES_URL` (e.g. `postgresql://localhost/taskmill_test`)

use std::{sync::Arc, time::Duration};
use taskmill::{Connector, Priority, connector::memory::MemoryConnector};
use uuid::Uuid;

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn contract_key_value(connector: Arc<dyn Connector>) {
    let key = unique("kv");

    assert!(connector.key_set(&key, b"first").await.unwrap());
    assert!(!connector.key_set(&key, b"second").await.unwrap());
    assert_eq!(connector.key_get(&key).await.unwrap().unwrap(), b"second");

    assert!(connector.key_delete(&key).await.unwrap());
    assert!(!connector.key_delete(&key).await.unwrap());
    assert!(connector.key_get(&key).await.unwrap().is_none());
}

async fn contract_priority_ordering(connector: Arc<dyn Connector>) {
    let queue = unique("prio");

    connector
        .queue_push(&queue, b"normal-a", Priority::Normal, None)
        .await
        .unwrap();
    connector
        .queue_push(&queue, b"normal-b", Priority::Normal, None)
        .await
        .unwrap();
    connector
        .queue_push(&queue, b"high", Priority::High, None)
        .await
        .unwrap();

    // Every high entry pops before any normal entry pushed earlier.
    assert_eq!(connector.queue_pop(&queue).await.unwrap().unwrap(), b"high");

    // Within one priority class order is backend-dependent; the class
    // itself is not.
    let mut normals = vec![
        connector.queue_pop(&queue).await.unwrap().unwrap(),
        connector.queue_pop(&queue).await.unwrap().unwrap(),
    ];
    normals.sort();
    assert_eq!(normals, vec![b"normal-a".to_vec(), b"normal-b".to_vec()]);

    assert!(connector.queue_pop(&queue).await.unwrap().is_none());
}

async fn contract_delayed_visibility(connector: Arc<dyn Connector>) {
    let queue = unique("delay");
    let visible_at = chrono::Utc::now() + chrono::Duration::milliseconds(800);

    connector
        .queue_push(&queue, b"later", Priority::High, Some(visible_at))
        .await
        .unwrap();

    assert!(connector.queue_pop(&queue).await.unwrap().is_none());
    assert_eq!(connector.queue_length(&queue, false).await.unwrap(), 0);
    assert_eq!(connector.queue_length(&queue, true).await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1_200)).await;

    assert_eq!(
        connector.queue_pop(&queue).await.unwrap().unwrap(),
        b"later"
    );
}

async fn contract_bulk_operations(connector: Arc<dyn Connector>) {
    let queue = unique("bulk");
    let items: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i]).collect();

    connector
        .queue_push_bulk(&queue, &items, Priority::Normal, None)
        .await
        .unwrap();
    assert_eq!(connector.queue_length(&queue, true).await.unwrap(), 5);

    // Partial pop, then the remainder; never more than what is visible.
    assert_eq!(connector.queue_pop_bulk(&queue, 2).await.unwrap().len(), 2);
    assert_eq!(connector.queue_pop_bulk(&queue, 10).await.unwrap().len(), 3);
    assert!(connector.queue_pop_bulk(&queue, 10).await.unwrap().is_empty());
}

async fn contract_bulk_delayed_visibility(connector: Arc<dyn Connector>) {
    let queue = unique("bulk-delay");
    let items: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i]).collect();
    let visible_at = chrono::Utc::now() + chrono::Duration::milliseconds(800);

    connector
        .queue_push_bulk(&queue, &items, Priority::Normal, Some(visible_at))
        .await
        .unwrap();

    assert!(connector.queue_pop_bulk(&queue, 10).await.unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(connector.queue_pop_bulk(&queue, 10).await.unwrap().len(), 3);
}

async fn contract_queue_delete(connector: Arc<dyn Connector>) {
    let queue = unique("del");

    connector
        .queue_push(&queue, b"x", Priority::Normal, None)
        .await
        .unwrap();
    connector
        .queue_push(
            &queue,
            b"parked",
            Priority::Normal,
            Some(chrono::Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    // Removes visible and delayed entries alike.
    assert!(connector.queue_delete(&queue).await.unwrap());
    assert_eq!(connector.queue_length(&queue, true).await.unwrap(), 0);
    assert!(!connector.queue_delete(&queue).await.unwrap());
}

async fn contract_lock(connector: Arc<dyn Connector>) {
    let name = unique("lock");
    let ttl = Duration::from_secs(60);
    let once = Some(Duration::ZERO);
    let tick = Duration::from_millis(20);

    let mut first = connector.lock(&name);
    let mut second = connector.lock(&name);

    // First wins, second loses while held, third try wins after release.
    assert!(first.acquire(once, tick, ttl).await.unwrap());
    assert!(!second.acquire(once, tick, ttl).await.unwrap());
    assert!(second.is_locked().await.unwrap());

    assert_eq!(first.get_ttl().await.unwrap(), Some(60));
    assert!(first.set_ttl(Duration::from_secs(30)).await.unwrap());
    let remaining = first.get_ttl().await.unwrap().unwrap();
    assert!(remaining <= 30);

    assert!(first.release().await.unwrap());
    assert!(!first.release().await.unwrap());
    assert!(second.acquire(once, tick, ttl).await.unwrap());
    assert!(second.release().await.unwrap());
}

async fn contract_lock_expiry(connector: Arc<dyn Connector>) {
    let name = unique("lock-exp");
    let once = Some(Duration::ZERO);
    let tick = Duration::from_millis(20);

    let mut crashed = connector.lock(&name);
    assert!(
        crashed
            .acquire(once, tick, Duration::from_secs(1))
            .await
            .unwrap()
    );

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    // The abandoned lock is no longer enforceable; a racing acquire wins.
    assert!(!crashed.is_locked().await.unwrap());
    assert!(crashed.get_ttl().await.unwrap().is_none());

    let mut next = connector.lock(&name);
    assert!(
        next.acquire(once, tick, Duration::from_secs(60))
            .await
            .unwrap()
    );
    assert!(!crashed.release().await.unwrap());
    assert!(next.is_locked().await.unwrap());
    assert!(next.release().await.unwrap());
}

async fn run_full_contract(connector: Arc<dyn Connector>) {
    contract_key_value(Arc::clone(&connector)).await;
    contract_priority_ordering(Arc::clone(&connector)).await;
    contract_delayed_visibility(Arc::clone(&connector)).await;
    contract_bulk_operations(Arc::clone(&connector)).await;
    contract_bulk_delayed_visibility(Arc::clone(&connector)).await;
    contract_queue_delete(Arc::clone(&connector)).await;
    contract_lock(Arc::clone(&connector)).await;
    contract_lock_expiry(connector).await;
}

#[tokio::test]
async fn memory_backend_contract() {
    run_full_contract(Arc::new(MemoryConnector::new())).await;
}

#[cfg(feature = "redis")]
mod redis_backend {
    use super::*;
    use taskmill::connector::redis::RedisConnector;

    fn url() -> String {
        std::env::var("TASKMILL_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn redis_backend_contract() {
        let connector = RedisConnector::connect(&url()).await.unwrap();
        run_full_contract(Arc::new(connector)).await;
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn sharded_backend_contract() {
        use taskmill::connector::sharded::ShardedConnector;

        // One node twice still exercises the rotation and routing paths.
        let connector = ShardedConnector::connect(&[url(), url()]).await.unwrap();
        run_full_contract(Arc::new(connector)).await;
    }
}

#[cfg(feature = "mongodb")]
mod mongo_backend {
    use super::*;
    use taskmill::connector::mongo::MongoConnector;

    #[tokio::test]
    #[ignore] // Requires a running MongoDB server
    async fn mongo_backend_contract() {
        let uri = std::env::var("TASKMILL_MONGO_URI")
            .unwrap_or_else(|_| "mongodb://127.0.0.1:27017".to_string());
        let connector = MongoConnector::connect(&uri, "taskmill_test").await.unwrap();
        run_full_contract(Arc::new(connector)).await;
    }
}

#[cfg(feature = "postgres")]
mod postgres_backend {
    use super::*;
    use taskmill::connector::postgres::PostgresConnector;

    #[tokio::test]
    #[ignore] // Requires a running PostgreSQL server
    async fn postgres_backend_contract() {
        let url = std::env::var("TASKMILL_POSTGRES_URL")
            .unwrap_or_else(|_| "postgresql://localhost/taskmill_test".to_string());
        let connector = PostgresConnector::connect(&url).await.unwrap();
        run_full_contract(Arc::new(connector)).await;
    }
}
