//! Redis-backed document store (feature `redis`).
//!
//! One hash per record at `{prefix}:{projection}:{aggregate_id}` with fields
//! `version` and `record` (the JSON-encoded `ProjectionRecord`). Saves run a Lua
//! script so a record never replaces one with a higher version.
//!
//! The `redis` client is synchronous; calls run on tokio's blocking pool over one
//! shared connection, reopened after a failed call.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::Commands;

use eventstorage_core::AggregateId;
use eventstorage_events::ProjectionRecord;

use crate::event_store::{ProjectionSink, StorageError};

const SAVE_IF_NEWER: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if current and tonumber(current) > tonumber(ARGV[1]) then
    return 0
end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'record', ARGV[2])
return 1
"#;

#[derive(Clone)]
pub struct RedisDocumentStore {
    client: Arc<redis::Client>,
    conn: Arc<Mutex<Option<redis::Connection>>>,
    prefix: String,
}

impl core::fmt::Debug for RedisDocumentStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisDocumentStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisDocumentStore {
    pub fn new(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StorageError::backend("redis_open", e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            conn: Arc::new(Mutex::new(None)),
            prefix: prefix.into(),
        })
    }

    fn key(&self, aggregate_id: &AggregateId, projection: &str) -> String {
        format!("{}:{projection}:{aggregate_id}", self.prefix)
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut redis::Connection) -> redis::RedisResult<T> + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let shared = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut slot = shared
                .lock()
                .map_err(|_| StorageError::backend(operation, "redis connection lock poisoned"))?;
            if slot.is_none() {
                let opened = client
                    .get_connection()
                    .map_err(|e| StorageError::backend(operation, e.to_string()))?;
                *slot = Some(opened);
            }
            let Some(conn) = slot.as_mut() else {
                return Err(StorageError::backend(operation, "redis connection unavailable"));
            };

            let result = f(conn);
            if result.is_err() {
                *slot = None;
            }
            result.map_err(|e| StorageError::backend(operation, e.to_string()))
        })
        .await
        .map_err(|e| StorageError::backend(operation, e.to_string()))?
    }

    /// Keys of every record stored for `projection`.
    async fn projection_keys(&self, projection: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{}:{projection}:*", self.prefix);
        self.blocking("projection_keys", move |conn| {
            let keys: Vec<String> = conn.scan_match(pattern)?.collect();
            Ok(keys)
        })
        .await
    }
}

#[async_trait]
impl ProjectionSink for RedisDocumentStore {
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        let key = self.key(aggregate_id, projection);
        let raw: Option<String> = self
            .blocking("load_record", move |conn| conn.hget(key, "record"))
            .await?;

        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| StorageError::decode("load_record", e.to_string()))
    }

    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
        let key = self.key(&record.aggregate_id, &record.projection);
        let json = serde_json::to_string(record).map_err(|e| StorageError::backend("save_record", e.to_string()))?;
        let version = record.version;

        let _: i64 = self
            .blocking("save_record", move |conn| {
                redis::Script::new(SAVE_IF_NEWER)
                    .key(key)
                    .arg(version)
                    .arg(json)
                    .invoke(conn)
            })
            .await?;
        Ok(())
    }

    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
        let keys = self.projection_keys(projection).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: usize = self.blocking("clear_projection", move |conn| conn.del(keys)).await?;
        Ok(removed)
    }
}
