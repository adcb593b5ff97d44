//! PostgreSQL relational connector via sqlx.
//!
//! Queue entries are rows ordered by `(score, id)`; a pop deletes the
//! lowest visible row through `FOR UPDATE SKIP LOCKED`, so concurrent
//! workers claim disjoint rows without ever blocking on each other. Bulk
//! pushes are one multi-row insert and therefore all-or-nothing. Locks are
//! rows with a primary-key uniqueness constraint and a conditional
//! steal-on-expiry upsert.

use crate::{
    Result,
    connector::{Connector, Lock},
    priority::{Priority, score_for, visibility_horizon},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct PostgresConnector {
    pool: PgPool,
}

impl PostgresConnector {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().connect(url).await?;
        let connector = Self { pool };
        connector.create_tables().await?;
        Ok(connector)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS taskmill_queue (
                id BIGSERIAL PRIMARY KEY,
                queue_name VARCHAR NOT NULL,
                score DOUBLE PRECISION NOT NULL,
                payload BYTEA NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_taskmill_queue_name_score
                ON taskmill_queue (queue_name, score, id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS taskmill_keys (
                name VARCHAR PRIMARY KEY,
                value BYTEA NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS taskmill_locks (
                name VARCHAR PRIMARY KEY,
                token UUID NOT NULL,
                expire_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool> {
        // The xmax system column is zero only for rows the inserting
        // transaction created, which distinguishes insert from overwrite
        // in a single statement.
        let row = sqlx::query(
            r#"
            INSERT INTO taskmill_keys (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<bool, _>("inserted"))
    }

    async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM taskmill_keys WHERE name = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM taskmill_keys WHERE name = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn queue_push(
        &self,
        queue: &str,
        item: &[u8],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        sqlx::query("INSERT INTO taskmill_queue (queue_name, score, payload) VALUES ($1, $2, $3)")
            .bind(queue)
            .bind(score_for(priority, consumable_from))
            .bind(item)
            .execute(&self.pool)
            .await?;

        Ok(true)
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

        // Single statement, so the batch lands atomically.
        sqlx::query(
            r#"
            INSERT INTO taskmill_queue (queue_name, score, payload)
            SELECT $1, $2, t.payload FROM UNNEST($3::bytea[]) AS t(payload)
            "#,
        )
        .bind(queue)
        .bind(score_for(priority, consumable_from))
        .bind(items)
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            r#"
            DELETE FROM taskmill_queue
            WHERE id = (
                SELECT id FROM taskmill_queue
                WHERE queue_name = $1 AND score <= $2
                ORDER BY score ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING payload
            "#,
        )
        .bind(queue)
        .bind(visibility_horizon(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("payload")))
    }

    async fn queue_pop_bulk(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            DELETE FROM taskmill_queue
            WHERE id IN (
                SELECT id FROM taskmill_queue
                WHERE queue_name = $1 AND score <= $2
                ORDER BY score ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $3
            )
            RETURNING id, score, payload
            "#,
        )
        .bind(queue)
        .bind(visibility_horizon(Utc::now()))
        .bind(count as i64)
        .fetch_all(&self.pool)
        .await?;

        // DELETE .. RETURNING has no defined row order; restore it.
        let mut rows: Vec<(f64, i64, Vec<u8>)> = rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<f64, _>("score"),
                    r.get::<i64, _>("id"),
                    r.get::<Vec<u8>, _>("payload"),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        Ok(rows.into_iter().map(|(_, _, payload)| payload).collect())
    }

    async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64> {
        let count: i64 = if include_delayed {
            sqlx::query("SELECT COUNT(*) AS count FROM taskmill_queue WHERE queue_name = $1")
                .bind(queue)
                .fetch_one(&self.pool)
                .await?
                .get("count")
        } else {
            sqlx::query(
                "SELECT COUNT(*) AS count FROM taskmill_queue WHERE queue_name = $1 AND score <= $2",
            )
            .bind(queue)
            .bind(visibility_horizon(Utc::now()))
            .fetch_one(&self.pool)
            .await?
            .get("count")
        };

        Ok(count.max(0) as u64)
    }

    async fn queue_delete(&self, queue: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM taskmill_queue WHERE queue_name = $1")
            .bind(queue)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    fn lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(PostgresLock {
            pool: self.pool.clone(),
            name: name.to_string(),
            token: Uuid::new_v4(),
            acquired: false,
        })
    }
}

struct PostgresLock {
    pool: PgPool,
    name: String,
    token: Uuid,
    acquired: bool,
}

#[async_trait]
impl Lock for PostgresLock {
    async fn try_acquire(&mut self, ttl: Duration) -> Result<bool> {
        // Fresh insert, or steal of an expired row; an unexpired holder
        // makes the conditional update match nothing.
        let result = sqlx::query(
            r#"
            INSERT INTO taskmill_locks (name, token, expire_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
                SET token = EXCLUDED.token, expire_at = EXCLUDED.expire_at
                WHERE taskmill_locks.expire_at <= now()
            "#,
        )
        .bind(&self.name)
        .bind(self.token)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            self.acquired = true;
        }
        Ok(acquired)
    }

    async fn release(&mut self) -> Result<bool> {
        let removed = if self.acquired {
            let result = sqlx::query("DELETE FROM taskmill_locks WHERE name = $1 AND token = $2")
                .bind(&self.name)
                .bind(self.token)
                .execute(&self.pool)
                .await?;
            result.rows_affected() == 1
        } else {
            false
        };
        self.acquired = false;

        // Sweep rows whose holders never came back.
        sqlx::query("DELETE FROM taskmill_locks WHERE expire_at <= now()")
            .execute(&self.pool)
            .await?;

        Ok(removed)
    }

    async fn is_locked(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS held FROM taskmill_locks WHERE name = $1 AND expire_at > now()",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn set_ttl(&mut self, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE taskmill_locks
            SET expire_at = now() + make_interval(secs => $2)
            WHERE name = $1 AND expire_at > now()
            "#,
        )
        .bind(&self.name)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_ttl(&self) -> Result<Option<u64>> {
        let row = sqlx::query(
            r#"
            SELECT CEIL(EXTRACT(EPOCH FROM (expire_at - now())))::BIGINT AS remaining
            FROM taskmill_locks
            WHERE name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|r| {
            let remaining: i64 = r.get("remaining");
            (remaining > 0).then_some(remaining as u64)
        }))
    }
}
