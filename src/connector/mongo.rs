//! MongoDB document-store connector.
//!
//! Queue entries live in one `queue` collection; a pop is a single
//! `findOneAndDelete` sorted by `(score, _id)`, which the server applies
//! atomically, so concurrent workers never double-claim an entry. Bulk
//! pops repeat that per item (per-item atomicity; MongoDB has no
//! multi-document claim primitive without transactions). Bulk pushes use
//! one ordered `insertMany` and are best-effort rather than transactional.
//!
//! Locks use the `_id` index as the uniqueness constraint: the lock name
//! is the document id, an insert of a held name fails with a duplicate-key
//! error, and expired rows are stolen with a conditional delete before the
//! insert is retried.

use crate::{
    Result,
    connector::{Connector, Lock},
    priority::{Priority, score_for, visibility_horizon},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use mongodb::{
    Client, Collection, IndexModel,
    bson::{Binary, Bson, DateTime as BsonDateTime, Document, doc, spec::BinarySubtype},
    error::{ErrorKind, WriteFailure},
    options::{FindOneAndDeleteOptions, UpdateOptions},
};
use std::time::Duration;
use uuid::Uuid;

fn binary(bytes: &[u8]) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Generic,
        bytes: bytes.to_vec(),
    })
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

#[derive(Clone)]
pub struct MongoConnector {
    queue: Collection<Document>,
    keys: Collection<Document>,
    locks: Collection<Document>,
}

impl MongoConnector {
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        let db = client.database(database);

        let connector = Self {
            queue: db.collection("taskmill_queue"),
            keys: db.collection("taskmill_keys"),
            locks: db.collection("taskmill_locks"),
        };

        // Pop filters and sorts on (queue, score, _id).
        connector
            .queue
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "queue": 1, "score": 1 })
                    .build(),
                None,
            )
            .await?;

        Ok(connector)
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn key_set(&self, key: &str, value: &[u8]) -> Result<bool> {
        let result = self
            .keys
            .update_one(
                doc! { "_id": key },
                doc! { "$set": { "value": binary(value) } },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(result.upserted_id.is_some())
    }

    async fn key_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let document = self.keys.find_one(doc! { "_id": key }, None).await?;
        Ok(document.and_then(|d| d.get_binary_generic("value").ok().cloned()))
    }

    async fn key_delete(&self, key: &str) -> Result<bool> {
        let result = self.keys.delete_one(doc! { "_id": key }, None).await?;
        Ok(result.deleted_count == 1)
    }

    async fn queue_push(
        &self,
        queue: &str,
        item: &[u8],
        priority: Priority,
        consumable_from: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let score = score_for(priority, consumable_from);
        self.queue
            .insert_one(
                doc! { "queue": queue, "score": score, "payload": binary(item) },
                None,
            )
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

        let score = score_for(priority, consumable_from);
        let documents: Vec<Document> = items
            .iter()
            .map(|item| doc! { "queue": queue, "score": score, "payload": binary(item) })
            .collect();
        self.queue.insert_many(documents, None).await?;
        Ok(true)
    }

    async fn queue_pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let horizon = visibility_horizon(Utc::now());
        let document = self
            .queue
            .find_one_and_delete(
                doc! { "queue": queue, "score": { "$lte": horizon } },
                FindOneAndDeleteOptions::builder()
                    .sort(doc! { "score": 1, "_id": 1 })
                    .build(),
            )
            .await?;
        Ok(document.and_then(|d| d.get_binary_generic("payload").ok().cloned()))
    }

    async fn queue_pop_bulk(&self, queue: &str, count: usize) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::new();
        for _ in 0..count {
            match self.queue_pop(queue).await? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        Ok(items)
    }

    async fn queue_length(&self, queue: &str, include_delayed: bool) -> Result<u64> {
        let filter = if include_delayed {
            doc! { "queue": queue }
        } else {
            doc! { "queue": queue, "score": { "$lte": visibility_horizon(Utc::now()) } }
        };
        Ok(self.queue.count_documents(filter, None).await?)
    }

    async fn queue_delete(&self, queue: &str) -> Result<bool> {
        let result = self.queue.delete_many(doc! { "queue": queue }, None).await?;
        Ok(result.deleted_count > 0)
    }

    fn lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(MongoLock {
            locks: self.locks.clone(),
            name: name.to_string(),
            token: Uuid::new_v4().to_string(),
            acquired: false,
        })
    }
}

struct MongoLock {
    locks: Collection<Document>,
    name: String,
    token: String,
    acquired: bool,
}

impl MongoLock {
    fn expire_at(ttl: Duration) -> Bson {
        let expire_at = ChronoDuration::from_std(ttl)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Bson::DateTime(BsonDateTime::from_millis(expire_at.timestamp_millis()))
    }

    fn now() -> Bson {
        Bson::DateTime(BsonDateTime::now())
    }
}

#[async_trait]
impl Lock for MongoLock {
    async fn try_acquire(&mut self, ttl: Duration) -> Result<bool> {
        // Evict an abandoned row first; the conditional delete is atomic,
        // so two stealers cannot both think they cleared the way and the
        // loser still fails on the unique _id below.
        self.locks
            .delete_one(
                doc! { "_id": &self.name, "expire_at": { "$lte": Self::now() } },
                None,
            )
            .await?;

        let insert = self
            .locks
            .insert_one(
                doc! {
                    "_id": &self.name,
                    "token": &self.token,
                    "expire_at": Self::expire_at(ttl),
                },
                None,
            )
            .await;

        match insert {
            Ok(_) => {
                self.acquired = true;
                Ok(true)
            }
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn release(&mut self) -> Result<bool> {
        let removed = if self.acquired {
            let result = self
                .locks
                .delete_one(doc! { "_id": &self.name, "token": &self.token }, None)
                .await?;
            result.deleted_count == 1
        } else {
            false
        };
        self.acquired = false;

        // Sweep rows whose holders never came back.
        self.locks
            .delete_many(doc! { "expire_at": { "$lte": Self::now() } }, None)
            .await?;

        Ok(removed)
    }

    async fn is_locked(&self) -> Result<bool> {
        let document = self
            .locks
            .find_one(
                doc! { "_id": &self.name, "expire_at": { "$gt": Self::now() } },
                None,
            )
            .await?;
        Ok(document.is_some())
    }

    async fn set_ttl(&mut self, ttl: Duration) -> Result<bool> {
        let result = self
            .locks
            .update_one(
                doc! { "_id": &self.name, "expire_at": { "$gt": Self::now() } },
                doc! { "$set": { "expire_at": Self::expire_at(ttl) } },
                None,
            )
            .await?;
        Ok(result.modified_count == 1)
    }

    async fn get_ttl(&self) -> Result<Option<u64>> {
        let document = self.locks.find_one(doc! { "_id": &self.name }, None).await?;

        Ok(document.and_then(|d| {
            // Whole seconds, rounded up, like Redis TTL.
            let expire_millis = d.get_datetime("expire_at").ok()?.timestamp_millis();
            let remaining_ms = expire_millis - Utc::now().timestamp_millis();
            (remaining_ms > 0).then_some(remaining_ms.div_ceil(1000) as u64)
        }))
    }
}
