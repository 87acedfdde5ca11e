//! Out-of-band projection application shared by catch-up, the projection worker
//! and `EventStore::restore_projection`.

use std::sync::Arc;

use tracing::debug;

use eventstorage_core::AggregateId;
use eventstorage_events::{
    DynProjection, EventEnvelope, Incremental, ProjectionRecord, ProjectionStore, SourcedEvent, engine,
};

use crate::event_store::{EventStoreError, ProjectionSink, StorageDriver};

/// Routes projection records to the sink their `ProjectionStore` selects.
///
/// `Relational` and `Selected` records live in the storage driver; `Document`
/// records live in the document store.
#[derive(Clone)]
pub struct ProjectionApplier<D> {
    driver: D,
    documents: Arc<dyn ProjectionSink>,
}

impl<D> core::fmt::Debug for ProjectionApplier<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionApplier").finish_non_exhaustive()
    }
}

impl<D: StorageDriver> ProjectionApplier<D> {
    pub fn new(driver: D, documents: Arc<dyn ProjectionSink>) -> Self {
        Self { driver, documents }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn sink_for(&self, store: ProjectionStore) -> &dyn ProjectionSink {
        match store {
            ProjectionStore::Document => self.documents.as_ref(),
            ProjectionStore::Relational | ProjectionStore::Selected => &self.driver,
        }
    }

    /// Apply a run of envelopes of one entity (ascending version) to its record.
    ///
    /// Versions already reflected in the record are skipped. When the run does not
    /// continue from the record, the record is rebuilt from the stored stream up to
    /// the last version of the run. Returns whether a record was written.
    pub async fn apply_batch(
        &self,
        projection: &dyn DynProjection,
        aggregate_id: &AggregateId,
        batch: &[EventEnvelope],
    ) -> Result<bool, EventStoreError> {
        let events: Vec<SourcedEvent> = batch.iter().map(|e| e.event().clone()).collect();
        let Some(up_to) = events.last().map(SourcedEvent::version) else {
            return Ok(false);
        };

        let sink = self.sink_for(projection.store());
        let existing = sink
            .load_record(aggregate_id, projection.name())
            .await
            .map_err(|e| EventStoreError::storage("apply_projection", context(projection, aggregate_id), e))?;

        let outcome = engine::project_incremental(projection, aggregate_id, existing.as_ref(), &events)
            .map_err(|e| EventStoreError::projection("apply_projection", projection.name(), aggregate_id.as_str(), e))?;

        let record = match outcome {
            Incremental::Updated(record) => Some(record),
            Incremental::Unchanged => None,
            Incremental::NeedsReplay { expected, found } => {
                debug!(
                    projection = projection.name(),
                    aggregate_id = %aggregate_id,
                    expected,
                    found,
                    "record does not continue; replaying stream"
                );
                self.replay(projection, aggregate_id, Some(up_to)).await?
            }
        };

        match record {
            Some(record) => {
                self.save(projection, &record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rebuild the record of one entity from its stored stream and save it.
    pub async fn rebuild(
        &self,
        projection: &dyn DynProjection,
        aggregate_id: &AggregateId,
    ) -> Result<bool, EventStoreError> {
        match self.replay(projection, aggregate_id, None).await? {
            Some(record) => {
                self.save(projection, &record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replay(
        &self,
        projection: &dyn DynProjection,
        aggregate_id: &AggregateId,
        up_to: Option<u64>,
    ) -> Result<Option<ProjectionRecord>, EventStoreError> {
        let envelopes = self
            .driver
            .load_stream(aggregate_id)
            .await
            .map_err(|e| EventStoreError::storage("replay_projection", context(projection, aggregate_id), e))?;

        let events: Vec<SourcedEvent> = envelopes
            .into_iter()
            .map(EventEnvelope::into_event)
            .filter(|e| up_to.is_none_or(|max| e.version() <= max))
            .collect();

        engine::project_record(projection, aggregate_id, &events)
            .map_err(|e| EventStoreError::projection("replay_projection", projection.name(), aggregate_id.as_str(), e))
    }

    async fn save(&self, projection: &dyn DynProjection, record: &ProjectionRecord) -> Result<(), EventStoreError> {
        self.sink_for(projection.store())
            .save_record(record)
            .await
            .map_err(|e| EventStoreError::storage("save_projection", context(projection, &record.aggregate_id), e))
    }
}

fn context(projection: &dyn DynProjection, aggregate_id: &AggregateId) -> String {
    format!("projection '{}' of '{aggregate_id}'", projection.name())
}

/// Split a sequence-ordered slice into runs of consecutive envelopes of one entity.
pub(crate) fn entity_runs(envelopes: &[EventEnvelope]) -> Vec<&[EventEnvelope]> {
    envelopes
        .chunk_by(|a, b| a.aggregate_id() == b.aggregate_id())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use eventstorage_core::TenantId;
    use eventstorage_events::UncommittedEvent;
    use serde_json::json;

    fn envelope(id: &str, version: u64, sequence: u64) -> EventEnvelope {
        UncommittedEvent {
            tenant_id: TenantId::unscoped(),
            aggregate_id: AggregateId::parse(id).unwrap(),
            aggregate_type: "test.entity".into(),
            event: SourcedEvent::from_parts("test.happened", 1, version, Utc::now(), None, json!({})),
        }
        .into_envelope(sequence)
    }

    #[test]
    fn runs_group_consecutive_envelopes_of_one_entity() {
        let envelopes = vec![
            envelope("a", 1, 1),
            envelope("a", 2, 2),
            envelope("b", 1, 3),
            envelope("a", 3, 4),
        ];

        let runs = entity_runs(&envelopes);

        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].len(), 2);
        assert_eq!(runs[2][0].version(), 3);
    }
}
