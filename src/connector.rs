//! Storage connectors: the queue + key/value + lock abstraction.
//!
//! A [`Connector`] is the only shared mutable resource in the system; all
//! cross-worker coordination goes through it. Every backend implements the
//! same contract with backend-native atomic primitives (atomic
//! delete-and-return, unique-constraint insert-or-fail, conditional
//! updates), never with client-side check-then-act.
//!
//! Backends:
//!
//! - [`memory`]: embedded in-process store, always available. Per-process
//!   only; producers and workers must share the same connector instance.
//! - `redis`: single Redis node (`redis` feature).
//! - `sharded`: several independent Redis nodes with no shared
//!   coordination (`redis` feature). Ordering across nodes is unspecified.
//! - `mongo`: MongoDB (`mongodb` feature).
//! - `postgres`: PostgreSQL via sqlx (`postgres` feature).

use crate::{Result, priority::Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

pub mod memory;

#[cfg(feature = "mongodb")]
pub mod mongo;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "redis")]
pub mod sharded;

/// Queue, key/value and lock operations shared by every backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Store `value` under `key`. Returns true iff this call created the
    /// key; overwriting an existing key still updates the value but
    /// returns false.
    async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool>;

    async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns true iff an entry was actually removed.
    async fn key_delete(&self, key: &str) -> Result<bool>;

    /// Push one item. `consumable_from`, when given, overrides the
    /// priority-derived ordering: the item becomes visible only once the
    /// current time reaches it.
    async fn queue_push(
        &self,
        queue: &str,
        item: &[u8],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Bulk push with the same semantics, amortized over the batch.
    ///
    /// One priority class per call: every item in the batch gets the same
    /// visibility score. Atomicity follows the backend's transaction
    /// model; backends without multi-item transactions apply best-effort
    /// and document it.
    async fn queue_push_bulk(
        &self,
        queue: &str,
        items: &[Vec<u8>],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Atomically remove and return the lowest-score currently-visible
    /// item. Returns None when nothing is visible, which is not the same
    /// as the queue being empty: delayed entries may still be parked.
    /// Never blocks.
    async fn queue_pop(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    /// Pop up to `count` visible items, per-item atomicity. Never blocks.
    async fn queue_pop_bulk(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>>;

    /// Entry count; with `include_delayed` false, only currently-visible
    /// entries are counted.
    async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64>;

    /// Drop all entries, visible or not. True iff at least one was removed.
    async fn queue_delete(&self, queue: &str) -> Result<bool>;

    /// A handle on the named distributed lock. Creating the handle does
    /// not touch the backend.
    fn lock(&self, name: &str) -> Box<dyn Lock>;
}

/// A handle on one named distributed lock.
///
/// At most one unexpired holder exists per name, enforced by a uniqueness
/// primitive in the backend. Locks are not reentrant: a second `acquire`
/// on the same name while held behaves exactly like contention from
/// another process.
#[async_trait]
pub trait Lock: Send {
    /// One attempt to take the lock with the given TTL. The TTL bounds how
    /// long the lock stays enforceable without release, so a crashed
    /// holder cannot park it forever.
    async fn try_acquire(&mut self, ttl: Duration) -> Result<bool>;

    /// Returns true iff this handle held the lock and exactly one row was
    /// removed. Backends without native expiry also garbage-collect any
    /// globally expired lock rows here.
    async fn release(&mut self) -> Result<bool>;

    /// True iff an unexpired row exists for the name, held by anyone.
    async fn is_locked(&self) -> Result<bool>;

    /// Extend the expiry of the currently held lock.
    async fn set_ttl(&mut self, ttl: Duration) -> Result<bool>;

    /// Remaining whole seconds, or None if expired or absent.
    async fn get_ttl(&self) -> Result<Option<u64>>;

    /// Acquire with the standard polling policy: `timeout` of None retries
    /// forever, a zero timeout attempts exactly once, anything else
    /// retries until the deadline. Failed attempts sleep `check_interval`.
    async fn acquire(
        &mut self,
        timeout: Option<Duration>,
        check_interval: Duration,
        ttl: Duration,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.try_acquire(ttl).await? {
                return Ok(true);
            }

            if let Some(t) = timeout {
                if t.is_zero() {
                    return Ok(false);
                }
                if let Some(d) = deadline {
                    if tokio::time::Instant::now() >= d {
                        return Ok(false);
                    }
                }
            }

            tokio::time::sleep(check_interval).await;
        }
    }
}

/// Backend selection plus backend-specific parameters.
///
/// This is the closed registry of connectors: [`connect`] resolves a
/// variant to a constructor exactly once, at broker or worker
/// initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorConfig {
    #[default]
    Memory,

    #[cfg(feature = "redis")]
    Redis { url: String },

    #[cfg(feature = "redis")]
    RedisSharded { urls: Vec<String> },

    #[cfg(feature = "mongodb")]
    Mongo { uri: String, database: String },

    #[cfg(feature = "postgres")]
    Postgres { url: String },
}

impl ConnectorConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            ConnectorConfig::Memory => "memory",
            #[cfg(feature = "redis")]
            ConnectorConfig::Redis { .. } => "redis",
            #[cfg(feature = "redis")]
            ConnectorConfig::RedisSharded { .. } => "redis_sharded",
            #[cfg(feature = "mongodb")]
            ConnectorConfig::Mongo { .. } => "mongo",
            #[cfg(feature = "postgres")]
            ConnectorConfig::Postgres { .. } => "postgres",
        }
    }
}

/// Resolve a [`ConnectorConfig`] to a live connector.
pub async fn connect(config: &ConnectorConfig) -> Result<Arc<dyn Connector>> {
    match config {
        ConnectorConfig::Memory => Ok(Arc::new(memory::MemoryConnector::new())),

        #[cfg(feature = "redis")]
        ConnectorConfig::Redis { url } => {
            Ok(Arc::new(self::redis::RedisConnector::connect(url).await?))
        }

        #[cfg(feature = "redis")]
        ConnectorConfig::RedisSharded { urls } => Ok(Arc::new(
            self::sharded::ShardedConnector::connect(urls).await?,
        )),

        #[cfg(feature = "mongodb")]
        ConnectorConfig::Mongo { uri, database } => Ok(Arc::new(
            self::mongo::MongoConnector::connect(uri, database).await?,
        )),

        #[cfg(feature = "postgres")]
        ConnectorConfig::Postgres { url } => Ok(Arc::new(
            self::postgres::PostgresConnector::connect(url).await?,
        )),
    }
}
