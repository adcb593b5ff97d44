//! Single-node Redis connector.
//!
//! Each queue is one sorted set keyed by visibility score; pops run a Lua
//! script so "find the lowest visible member and remove it" is a single
//! atomic step on the server. Locks use `SET NX PX` with a per-handle
//! token and a compare-and-delete script, and lean on Redis key expiry for
//! the TTL, so there are no stale rows to garbage-collect.
//!
//! Sorted sets deduplicate members, and two tasks can serialize to the
//! same bytes, so every queued member is framed with a random 16-byte
//! nonce that is stripped on pop.

use crate::{
    Result,
    connector::{Connector, Lock},
    priority::{Priority, score_for, visibility_horizon},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use uuid::Uuid;

const POP_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #items > 0 then
    redis.call('ZREM', KEYS[1], unpack(items))
end
return items
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const NONCE_LEN: usize = 16;

fn queue_key(queue: &str) -> String {
    format!("taskmill:queue:{}", queue)
}

fn kv_key(key: &str) -> String {
    format!("taskmill:key:{}", key)
}

fn lock_key(name: &str) -> String {
    format!("taskmill:lock:{}", name)
}

/// Frame a payload with a random nonce so identical payloads stay
/// distinct sorted-set members.
fn frame_member(item: &[u8]) -> Vec<u8> {
    let mut member = Vec::with_capacity(NONCE_LEN + item.len());
    member.extend_from_slice(Uuid::new_v4().as_bytes());
    member.extend_from_slice(item);
    member
}

fn unframe_member(mut member: Vec<u8>) -> Vec<u8> {
    if member.len() >= NONCE_LEN {
        member.drain(..NONCE_LEN);
    }
    member
}

#[derive(Clone)]
pub struct RedisConnector {
    conn: MultiplexedConnection,
    pop_script: redis::Script,
}

impl RedisConnector {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            pop_script: redis::Script::new(POP_SCRIPT),
        })
    }

    async fn pop_members(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let horizon = visibility_horizon(Utc::now());
        let members: Vec<Vec<u8>> = self
            .pop_script
            .key(queue_key(queue))
            .arg(horizon)
            .arg(count)
            .invoke_async(&mut conn)
            .await?;
        Ok(members.into_iter().map(unframe_member).collect())
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut conn = self.conn.clone();
        let previous: Option<Vec<u8>> = redis::cmd("SET")
            .arg(kv_key(key))
            .arg(value)
            .arg("GET")
            .query_async(&mut conn)
            .await?;
        Ok(previous.is_none())
    }

    async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(kv_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(kv_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn queue_push(
        &self,
        queue: &str,
        item: &[u8],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let score = score_for(priority, consumable_from);
        let added: i64 = redis::cmd("ZADD")
            .arg(queue_key(queue))
            .arg(score)
            .arg(frame_member(item))
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn queue_push_bulk(
        &self,
        queue: &str,
        items: &[Vec<u8>],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        if items.is_empty() {
            return Ok(true);
        }

        let mut conn = self.conn.clone();
        let score = score_for(priority, consumable_from);

        // One ZADD with every score/member pair applies atomically.
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(queue_key(queue));
        for item in items {
            cmd.arg(score).arg(frame_member(item));
        }
        let added: i64 = cmd.query_async(&mut conn).await?;
        Ok(added == items.len() as i64)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.pop_members(queue, 1).await?.into_iter().next())
    }

    async fn queue_pop_bulk(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        self.pop_members(queue, count).await
    }

    async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = if include_delayed {
            redis::cmd("ZCARD")
                .arg(queue_key(queue))
                .query_async(&mut conn)
                .await?
        } else {
            redis::cmd("ZCOUNT")
                .arg(queue_key(queue))
                .arg("-inf")
                .arg(visibility_horizon(Utc::now()))
                .query_async(&mut conn)
                .await?
        };
        Ok(count.max(0) as u64)
    }

    async fn queue_delete(&self, queue: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(queue_key(queue))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    fn lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(RedisLock {
            conn: self.conn.clone(),
            key: lock_key(name),
            token: Uuid::new_v4().to_string(),
            acquired: false,
        })
    }
}

struct RedisLock {
    conn: MultiplexedConnection,
    key: String,
    token: String,
    acquired: bool,
}

#[async_trait]
impl Lock for RedisLock {
    async fn try_acquire(&mut self, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        if outcome.is_some() {
            self.acquired = true;
        }
        Ok(outcome.is_some())
    }

    async fn release(&mut self) -> Result<bool> {
        if !self.acquired {
            return Ok(false);
        }
        self.acquired = false;

        let mut conn = self.conn.clone();
        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn is_locked(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn set_ttl(&mut self, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(&self.key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn get_ttl(&self) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let remaining: i64 = redis::cmd("TTL")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok((remaining > 0).then_some(remaining as u64))
    }
}
