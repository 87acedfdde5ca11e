use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use eventstorage_core::AggregateId;
use eventstorage_events::{Checkpoint, CheckpointType, EventEnvelope, ProjectionRecord, UncommittedEvent};

use super::r#trait::{ProjectionSink, StorageDriver, StorageError, UnitOfWork};

#[derive(Debug, Clone, Default)]
struct State {
    /// Global log keyed by sequence.
    log: BTreeMap<u64, EventEnvelope>,
    /// Per-entity sequences, in version order.
    streams: HashMap<AggregateId, Vec<u64>>,
    records: HashMap<(AggregateId, String), ProjectionRecord>,
    checkpoints: HashMap<(String, CheckpointType), Checkpoint>,
    last_sequence: u64,
}

impl State {
    fn stream_version(&self, aggregate_id: &AggregateId) -> Option<u64> {
        self.streams
            .get(aggregate_id)
            .and_then(|seqs| seqs.last())
            .and_then(|seq| self.log.get(seq))
            .map(EventEnvelope::version)
    }

    fn append(&mut self, events: Vec<UncommittedEvent>) -> Result<Vec<EventEnvelope>, StorageError> {
        let mut committed = Vec::with_capacity(events.len());
        for event in events {
            let current = self.stream_version(&event.aggregate_id).unwrap_or(0);
            let version = event.event.version();
            if version <= current {
                return Err(StorageError::conflict(
                    "append",
                    format!("{} version {version} already exists", event.aggregate_id),
                ));
            }
            if version != current + 1 {
                return Err(StorageError::backend(
                    "append",
                    format!("{} version {version} does not follow {current}", event.aggregate_id),
                ));
            }

            self.last_sequence += 1;
            let sequence = self.last_sequence;
            self.streams
                .entry(event.aggregate_id.clone())
                .or_default()
                .push(sequence);

            let envelope = event.into_envelope(sequence);
            self.log.insert(sequence, envelope.clone());
            committed.push(envelope);
        }
        Ok(committed)
    }

    fn save_record(&mut self, record: &ProjectionRecord) {
        let key = (record.aggregate_id.clone(), record.projection.clone());
        match self.records.get(&key) {
            Some(stored) if stored.version > record.version => {}
            _ => {
                self.records.insert(key, record.clone());
            }
        }
    }
}

/// In-memory storage driver.
///
/// Intended for tests/dev. Units of work are serialized: `begin` takes the store
/// lock and works on a copy of the state, which replaces the shared state on
/// commit. Reads wait while a unit of work is open.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<State>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored envelopes.
    pub async fn len(&self) -> usize {
        self.state.lock().await.log.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Unit of work over a working copy of the in-memory state.
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn stream_version(&mut self, aggregate_id: &AggregateId) -> Result<Option<u64>, StorageError> {
        Ok(self.working.stream_version(aggregate_id))
    }

    async fn append(&mut self, events: Vec<UncommittedEvent>) -> Result<Vec<EventEnvelope>, StorageError> {
        self.working.append(events)
    }

    async fn load_record(
        &mut self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        Ok(self
            .working
            .records
            .get(&(aggregate_id.clone(), projection.to_string()))
            .cloned())
    }

    async fn save_record(&mut self, record: &ProjectionRecord) -> Result<(), StorageError> {
        self.working.save_record(record);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let InMemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[async_trait]
impl ProjectionSink for InMemoryStorage {
    async fn load_record(
        &self,
        aggregate_id: &AggregateId,
        projection: &str,
    ) -> Result<Option<ProjectionRecord>, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(&(aggregate_id.clone(), projection.to_string()))
            .cloned())
    }

    async fn save_record(&self, record: &ProjectionRecord) -> Result<(), StorageError> {
        self.state.lock().await.save_record(record);
        Ok(())
    }

    async fn clear_projection(&self, projection: &str) -> Result<usize, StorageError> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state.records.retain(|(_, name), _| name != projection);
        Ok(before - state.records.len())
    }
}

#[async_trait]
impl StorageDriver for InMemoryStorage {
    async fn create_if_missing(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StorageError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork { guard, working }))
    }

    async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<EventEnvelope>, StorageError> {
        let state = self.state.lock().await;
        let Some(seqs) = state.streams.get(aggregate_id) else {
            return Ok(vec![]);
        };
        seqs.iter()
            .map(|seq| {
                state
                    .log
                    .get(seq)
                    .cloned()
                    .ok_or_else(|| StorageError::decode("load_stream", format!("sequence {seq} missing from log")))
            })
            .collect()
    }

    async fn load_range(&self, after: u64, up_to: u64) -> Result<Vec<EventEnvelope>, StorageError> {
        if up_to <= after {
            return Ok(vec![]);
        }
        let state = self.state.lock().await;
        Ok(state.log.range(after + 1..=up_to).map(|(_, e)| e.clone()).collect())
    }

    async fn max_sequence(&self) -> Result<u64, StorageError> {
        Ok(self.state.lock().await.log.keys().next_back().copied().unwrap_or(0))
    }

    async fn load_checkpoint(
        &self,
        subscription: &str,
        kind: CheckpointType,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.checkpoints.get(&(subscription.to_string(), kind)).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint, insert: bool) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let key = (checkpoint.subscription().to_string(), checkpoint.kind());
        let stored_seq = state.checkpoints.get(&key).map(Checkpoint::seq);

        match (insert, stored_seq) {
            (true, Some(_)) => Err(StorageError::conflict(
                "save_checkpoint",
                format!("checkpoint '{}' already exists", checkpoint.subscription()),
            )),
            (false, None) => Err(StorageError::missing(
                "save_checkpoint",
                format!("checkpoint '{}' does not exist", checkpoint.subscription()),
            )),
            (false, Some(stored)) if stored > checkpoint.seq() => Ok(()),
            _ => {
                state.checkpoints.insert(key, checkpoint.clone());
                Ok(())
            }
        }
    }

    async fn reset_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let key = (checkpoint.subscription().to_string(), checkpoint.kind());
        match state.checkpoints.get_mut(&key) {
            Some(stored) => {
                *stored = checkpoint.clone();
                Ok(())
            }
            None => Err(StorageError::missing(
                "reset_checkpoint",
                format!("checkpoint '{}' does not exist", checkpoint.subscription()),
            )),
        }
    }
}
