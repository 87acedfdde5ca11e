use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use eventstorage_core::AggregateId;
use eventstorage_events::ProjectionRecord;

use crate::event_store::{ProjectionSink, StorageError};

/// In-memory document store for `Document`-store projections (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<HashMap<(AggregateId, String), ProjectionRecord>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records of one projection, in no particular order.
    pub fn list(&self, projection: &str) -> Vec<ProjectionRecord> {
        let map = match self.inner.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };

        map.values()
            .filter(|r| r.projection == projection)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProjectionSink for InMemoryDocumentStore {
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        let map = self
            .inner
            .read()
            .map_err(|_| StorageError::backend("load_record", "document store poisoned"))?;
        Ok(map.get(&(aggregate_id.clone(), projection.to_string())).cloned())
    }

    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| StorageError::backend("save_record", "document store poisoned"))?;

        let key = (record.aggregate_id.clone(), record.projection.clone());
        match map.get(&key) {
            Some(stored) if stored.version > record.version => {}
            _ => {
                map.insert(key, record.clone());
            }
        }
        Ok(())
    }

    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| StorageError::backend("clear_projection", "document store poisoned"))?;

        let before = map.len();
        map.retain(|(_id, p), _r| p != projection);
        Ok(before - map.len())
    }
}
