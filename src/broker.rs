//! Task-oriented orchestration over a connector and an encoder.
//!
//! The broker is deliberately thin: it encodes tasks on the way in,
//! decodes them on the way out, and delegates everything else to the
//! connector. Connector errors propagate to the caller uncaught at this
//! layer; the worker layer decides what to log and how to recover.

use crate::{
    Result,
    connector::{Connector, ConnectorConfig, Lock, connect},
    encoder::Encoder,
    priority::Priority,
    task::Task,
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};

pub struct Broker {
    connector: Arc<dyn Connector>,
    encoder: Encoder,
}

impl Broker {
    pub fn new(connector: Arc<dyn Connector>, encoder: Encoder) -> Self {
        Self { connector, encoder }
    }

    /// Resolve the connector from configuration and wrap it.
    pub async fn from_config(connector: &ConnectorConfig, encoder: Encoder) -> Result<Self> {
        Ok(Self::new(connect(connector).await?, encoder))
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    pub async fn push_task(
        &self,
        queue: &str,
        task: &Task,
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let bytes = self.encoder.encode(task)?;
        self.connector
            .queue_push(queue, &bytes, priority, consumable_from)
            .await
    }

    pub async fn push_tasks(
        &self,
        queue: &str,
        tasks: &[Task],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut items = Vec::with_capacity(tasks.len());
        for task in tasks {
            items.push(self.encoder.encode(task)?);
        }
        self.connector
            .queue_push_bulk(queue, &items, priority, consumable_from)
            .await
    }

    pub async fn get_task(&self, queue: &str) -> Result<Option<Task>> {
        match self.connector.queue_pop(queue).await? {
            Some(bytes) => Ok(Some(self.encoder.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn get_tasks(&self, queue: &str, count: usize) -> Result<Vec<Task>> {
        let items = self.connector.queue_pop_bulk(queue, count).await?;
        let mut tasks = Vec::with_capacity(items.len());
        for bytes in items {
            tasks.push(self.encoder.decode(&bytes)?);
        }
        Ok(tasks)
    }

    /// Re-push with the run count bumped. The caller keeps the original;
    /// the queue receives the incremented copy.
    pub async fn retry(&self, queue: &str, task: &Task) -> Result<bool> {
        self.push_task(queue, &task.retried(), Priority::Normal, None)
            .await
    }

    /// Re-push byte-for-byte unchanged.
    pub async fn requeue(&self, queue: &str, task: &Task) -> Result<bool> {
        self.push_task(queue, task, Priority::Normal, None).await
    }

    pub async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64> {
        self.connector.queue_length(queue, include_delayed).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<bool> {
        self.connector.queue_delete(queue).await
    }

    /// Poll until no visible entries remain. Returns whether the queue
    /// drained before the timeout; None polls forever.
    pub async fn wait_queue_empty(
        &self,
        queue: &str,
        timeout: Option<Duration>,
        sample_interval: Duration,
    ) -> Result<bool> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            if self.queue_length(queue, false).await? == 0 {
                return Ok(true);
            }

            if let Some(d) = deadline {
                if tokio::time::Instant::now() >= d {
                    return Ok(false);
                }
            }

            tokio::time::sleep(sample_interval).await;
        }
    }

    pub async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool> {
        self.connector.key_set(key, value).await
    }

    pub async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.connector.key_get(key).await
    }

    pub async fn key_delete(&self, key: &str) -> Result<bool> {
        self.connector.key_delete(key).await
    }

    pub fn lock(&self, name: &str) -> Box<dyn Lock> {
        self.connector.lock(name)
    }
}
