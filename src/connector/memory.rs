//! Embedded in-process connector.
//!
//! Backs the whole connector contract with plain data structures behind a
//! mutex. This is the zero-dependency backend for single-process
//! deployments, examples and tests; it cannot coordinate across processes,
//! so producers and workers must share the same instance (clones share
//! state).
//!
//! The connector carries an injectable clock so delayed visibility and
//! lock expiry can be driven deterministically from tests.
//!
//! # Examples
//!
//! ```rust
//! use taskmill::connector::{Connector, memory::{MemoryConnector, MockClock}};
//! use taskmill::Priority;
//! use chrono::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> taskmill::Result<()> {
//! let clock = MockClock::new();
//! let connector = MemoryConnector::with_clock(clock.clone());
//!
//! let visible_at = clock.now() + Duration::seconds(60);
//! connector.queue_push("q", b"later", Priority::Normal, Some(visible_at)).await?;
//!
//! // Parked until the clock reaches the deadline.
//! assert!(connector.queue_pop("q").await?.is_none());
//! clock.advance(Duration::seconds(60));
//! assert_eq!(connector.queue_pop("q").await?.as_deref(), Some(&b"later"[..]));
//! # Ok(())
//! # }
//! ```

use crate::{
    Result,
    connector::{Connector, Lock},
    priority::{Priority, score_for, visibility_horizon},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};
use uuid::Uuid;

/// Controllable clock for testing time-dependent behavior.
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            current_time: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }

    pub fn advance(&self, duration: ChronoDuration) {
        let mut time = self.current_time.lock().unwrap();
        *time += duration;
    }

    pub fn set(&self, time: DateTime<Utc>) {
        *self.current_time.lock().unwrap() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
enum ClockSource {
    System,
    Mock(MockClock),
}

impl ClockSource {
    fn now(&self) -> DateTime<Utc> {
        match self {
            ClockSource::System => Utc::now(),
            ClockSource::Mock(clock) => clock.now(),
        }
    }
}

/// Queue entries sort by score, then by insertion sequence.
#[derive(Debug, Clone, Copy)]
struct EntryKey {
    score: f64,
    seq: u64,
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EntryKey {}

#[derive(Debug, Clone)]
struct LockRow {
    token: Uuid,
    expire_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Store {
    queues: HashMap<String, BTreeMap<EntryKey, Vec<u8>>>,
    keys: HashMap<String, Vec<u8>>,
    locks: HashMap<String, LockRow>,
    seq: u64,
}

/// In-process connector; clones share the same store.
#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<Mutex<Store>>,
    clock: ClockSource,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            clock: ClockSource::System,
        }
    }

    pub fn with_clock(clock: MockClock) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            clock: ClockSource::Mock(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut store = self.store.lock().unwrap();
        Ok(store.keys.insert(key.to_string(), value.to_vec()).is_none())
    }

    async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let store = self.store.lock().unwrap();
        Ok(store.keys.get(key).cloned())
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let mut store = self.store.lock().unwrap();
        Ok(store.keys.remove(key).is_some())
    }

    async fn queue_push(
        &self,
        queue: &str,
        item: &[u8],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let score = score_for(priority, consumable_from);
        let mut store = self.store.lock().unwrap();
        store.seq += 1;
        let key = EntryKey {
            score,
            seq: store.seq,
        };
        store
            .queues
            .entry(queue.to_string())
            .or_default()
            .insert(key, item.to_vec());
        Ok(true)
    }

    async fn queue_push_bulk(
        &self,
        queue: &str,
        items: &[Vec<u8>],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let score = score_for(priority, consumable_from);
        let mut store = self.store.lock().unwrap();
        for item in items {
            store.seq += 1;
            let key = EntryKey {
                score,
                seq: store.seq,
            };
            store
                .queues
                .entry(queue.to_string())
                .or_default()
                .insert(key, item.clone());
        }
        Ok(true)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let horizon = visibility_horizon(self.now());
        let mut store = self.store.lock().unwrap();

        let Some(entries) = store.queues.get_mut(queue) else {
            return Ok(None);
        };

        let bound = EntryKey {
            score: horizon,
            seq: u64::MAX,
        };
        let Some(key) = entries.range(..=bound).next().map(|(k, _)| *k) else {
            return Ok(None);
        };

        Ok(entries.remove(&key))
    }

    async fn queue_pop_bulk(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let horizon = visibility_horizon(self.now());
        let mut store = self.store.lock().unwrap();

        let Some(entries) = store.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let bound = EntryKey {
            score: horizon,
            seq: u64::MAX,
        };
        let keys: Vec<EntryKey> = entries
            .range(..=bound)
            .take(count)
            .map(|(k, _)| *k)
            .collect();

        Ok(keys
            .into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect())
    }

    async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64> {
        let horizon = visibility_horizon(self.now());
        let store = self.store.lock().unwrap();

        let Some(entries) = store.queues.get(queue) else {
            return Ok(0);
        };

        if include_delayed {
            return Ok(entries.len() as u64);
        }

        let bound = EntryKey {
            score: horizon,
            seq: u64::MAX,
        };
        Ok(entries.range(..=bound).count() as u64)
    }

    async fn queue_delete(&self, queue: &str) -> Result<bool> {
        let mut store = self.store.lock().unwrap();
        Ok(store
            .queues
            .remove(queue)
            .is_some_and(|entries| !entries.is_empty()))
    }

    fn lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(MemoryLock {
            store: Arc::clone(&self.store),
            clock: self.clock.clone(),
            name: name.to_string(),
            token: Uuid::new_v4(),
            acquired: false,
        })
    }
}

struct MemoryLock {
    store: Arc<Mutex<Store>>,
    clock: ClockSource,
    name: String,
    token: Uuid,
    acquired: bool,
}

#[async_trait]
impl Lock for MemoryLock {
    async fn try_acquire(&mut self, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut store = self.store.lock().unwrap();

        let held = store
            .locks
            .get(&self.name)
            .is_some_and(|row| row.expire_at > now);
        if held {
            return Ok(false);
        }

        let expire_at = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        store.locks.insert(
            self.name.clone(),
            LockRow {
                token: self.token,
                expire_at,
            },
        );
        self.acquired = true;
        Ok(true)
    }

    async fn release(&mut self) -> Result<bool> {
        let now = self.clock.now();
        let mut store = self.store.lock().unwrap();

        let removed = if self.acquired {
            let ours = store
                .locks
                .get(&self.name)
                .is_some_and(|row| row.token == self.token);
            if ours {
                store.locks.remove(&self.name);
            }
            ours
        } else {
            false
        };
        self.acquired = false;

        // Sweep rows whose holders never came back.
        store.locks.retain(|_, row| row.expire_at > now);

        Ok(removed)
    }

    async fn is_locked(&self) -> Result<bool> {
        let now = self.clock.now();
        let store = self.store.lock().unwrap();
        Ok(store
            .locks
            .get(&self.name)
            .is_some_and(|row| row.expire_at > now))
    }

    async fn set_ttl(&mut self, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut store = self.store.lock().unwrap();

        match store.locks.get_mut(&self.name) {
            Some(row) if row.expire_at > now => {
                row.expire_at = ChronoDuration::from_std(ttl)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_ttl(&self) -> Result<Option<u64>> {
        let now = self.clock.now();
        let store = self.store.lock().unwrap();

        Ok(store.locks.get(&self.name).and_then(|row| {
            // Whole seconds, rounded up, like Redis TTL.
            let remaining_ms = (row.expire_at - now).num_milliseconds();
            (remaining_ms > 0).then_some((remaining_ms as u64).div_ceil(1000))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_set_reports_fresh_insert() {
        let connector = MemoryConnector::new();

        assert!(connector.key_set("k", b"v1").await.unwrap());
        assert!(!connector.key_set("k", b"v2").await.unwrap());
        assert_eq!(connector.key_get("k").await.unwrap().unwrap(), b"v2");

        assert!(connector.key_delete("k").await.unwrap());
        assert!(!connector.key_delete("k").await.unwrap());
        assert!(connector.key_get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_high_priority_pops_before_earlier_normal() {
        let connector = MemoryConnector::new();

        connector
            .queue_push("q", b"normal-1", Priority::Normal, None)
            .await
            .unwrap();
        connector
            .queue_push("q", b"normal-2", Priority::Normal, None)
            .await
            .unwrap();
        connector
            .queue_push("q", b"high-1", Priority::High, None)
            .await
            .unwrap();

        assert_eq!(connector.queue_pop("q").await.unwrap().unwrap(), b"high-1");
        assert_eq!(
            connector.queue_pop("q").await.unwrap().unwrap(),
            b"normal-1"
        );
        assert_eq!(
            connector.queue_pop("q").await.unwrap().unwrap(),
            b"normal-2"
        );
        assert!(connector.queue_pop("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_priority_preserves_insertion_order() {
        let connector = MemoryConnector::new();

        for i in 0..5u8 {
            connector
                .queue_push("q", &[i], Priority::Normal, None)
                .await
                .unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(connector.queue_pop("q").await.unwrap().unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_delayed_entry_invisible_until_deadline() {
        let clock = MockClock::new();
        let connector = MemoryConnector::with_clock(clock.clone());

        let visible_at = clock.now() + ChronoDuration::seconds(120);
        connector
            .queue_push("q", b"delayed", Priority::High, Some(visible_at))
            .await
            .unwrap();

        assert!(connector.queue_pop("q").await.unwrap().is_none());
        assert_eq!(connector.queue_length("q", false).await.unwrap(), 0);
        assert_eq!(connector.queue_length("q", true).await.unwrap(), 1);

        clock.advance(ChronoDuration::seconds(120));

        assert_eq!(connector.queue_length("q", false).await.unwrap(), 1);
        assert_eq!(connector.queue_pop("q").await.unwrap().unwrap(), b"delayed");
    }

    #[tokio::test]
    async fn test_bulk_push_delayed_visibility() {
        let clock = MockClock::new();
        let connector = MemoryConnector::with_clock(clock.clone());

        let visible_at = clock.now() + ChronoDuration::seconds(30);
        let items = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        connector
            .queue_push_bulk("q", &items, Priority::Normal, Some(visible_at))
            .await
            .unwrap();

        assert!(connector.queue_pop_bulk("q", 3).await.unwrap().is_empty());
        clock.advance(ChronoDuration::seconds(30));

        let popped = connector.queue_pop_bulk("q", 5).await.unwrap();
        assert_eq!(popped, items);
    }

    #[tokio::test]
    async fn test_pop_bulk_returns_what_is_visible() {
        let connector = MemoryConnector::new();
        connector
            .queue_push_bulk(
                "q",
                &[b"1".to_vec(), b"2".to_vec()],
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        let popped = connector.queue_pop_bulk("q", 10).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert!(connector.queue_pop_bulk("q", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_delete_removes_delayed_entries_too() {
        let clock = MockClock::new();
        let connector = MemoryConnector::with_clock(clock.clone());

        connector
            .queue_push("q", b"now", Priority::Normal, None)
            .await
            .unwrap();
        connector
            .queue_push(
                "q",
                b"later",
                Priority::Normal,
                Some(clock.now() + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        assert!(connector.queue_delete("q").await.unwrap());
        assert_eq!(connector.queue_length("q", true).await.unwrap(), 0);
        assert!(!connector.queue_delete("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_exclusive_until_released() {
        let connector = MemoryConnector::new();
        let ttl = Duration::from_secs(60);
        let once = Some(Duration::ZERO);
        let tick = Duration::from_millis(10);

        let mut first = connector.lock("job");
        let mut second = connector.lock("job");

        assert!(first.acquire(once, tick, ttl).await.unwrap());
        assert!(!second.acquire(once, tick, ttl).await.unwrap());
        assert!(second.is_locked().await.unwrap());

        assert!(first.release().await.unwrap());
        assert!(!first.release().await.unwrap());
        assert!(second.acquire(once, tick, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_ttl_read_and_extend() {
        let connector = MemoryConnector::new();
        let mut lock = connector.lock("ttl");

        assert!(lock.try_acquire(Duration::from_secs(60)).await.unwrap());
        assert_eq!(lock.get_ttl().await.unwrap(), Some(60));

        assert!(lock.set_ttl(Duration::from_secs(30)).await.unwrap());
        let remaining = lock.get_ttl().await.unwrap().unwrap();
        assert!(remaining <= 30);
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_stolen() {
        let clock = MockClock::new();
        let connector = MemoryConnector::with_clock(clock.clone());

        let mut crashed = connector.lock("job");
        assert!(crashed.try_acquire(Duration::from_secs(5)).await.unwrap());

        clock.advance(ChronoDuration::seconds(6));

        assert!(!crashed.is_locked().await.unwrap());
        assert!(crashed.get_ttl().await.unwrap().is_none());

        let mut next = connector.lock("job");
        assert!(next.try_acquire(Duration::from_secs(5)).await.unwrap());

        // The original holder lost the row; releasing it must not unlock
        // the new holder.
        assert!(!crashed.release().await.unwrap());
        assert!(next.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_with_deadline_gives_up() {
        let connector = MemoryConnector::new();
        let ttl = Duration::from_secs(60);

        let mut holder = connector.lock("busy");
        assert!(holder.try_acquire(ttl).await.unwrap());

        let mut waiter = connector.lock("busy");
        let acquired = waiter
            .acquire(
                Some(Duration::from_millis(50)),
                Duration::from_millis(10),
                ttl,
            )
            .await
            .unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let connector = MemoryConnector::new();
        let clone = connector.clone();

        connector
            .queue_push("q", b"shared", Priority::Normal, None)
            .await
            .unwrap();
        assert_eq!(clone.queue_pop("q").await.unwrap().unwrap(), b"shared");
    }
}
