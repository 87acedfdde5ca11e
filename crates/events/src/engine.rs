//! Projection engine: full folds and incremental updates of persisted records.
//!
//! Persisted records remember the last entity version they have seen. Incremental
//! application only folds events above that version, so redelivering an event
//! (commit retry, catch-up after a crash before the checkpoint was saved) never
//! applies it twice. A version gap between the record and the new events cannot be
//! bridged incrementally and is reported as `Incremental::NeedsReplay`.

use chrono::Utc;

use eventstorage_core::AggregateId;

use crate::event::SourcedEvent;
use crate::projection::{DynProjection, Projection, ProjectionError, ProjectionRecord};

/// Outcome of an incremental projection update.
#[derive(Debug, Clone, PartialEq)]
pub enum Incremental {
    /// The record to store.
    Updated(ProjectionRecord),
    /// Every event was already reflected in the existing record.
    Unchanged,
    /// The events do not continue from the record; rebuild from the full stream.
    NeedsReplay { expected: u64, found: u64 },
}

/// True iff any event's type matches the projection's subscription.
pub fn subscribes(events: &[SourcedEvent], projection: &dyn DynProjection) -> bool {
    events.iter().any(|e| projection.subscribes_to(e.event_type()))
}

/// Pure fold of `events` into `P::Model`, starting from the zero value.
pub fn project<P: Projection>(projection: &P, events: &[SourcedEvent]) -> Result<P::Model, ProjectionError> {
    let mut model = P::Model::default();
    for event in events.iter().filter(|e| Projection::subscribes_to(projection, e.event_type())) {
        Projection::apply(projection, &mut model, event)?;
    }
    Ok(model)
}

/// Full replay of an entity's stream into a record.
///
/// Returns `None` when no event in the stream is subscribed (the entity has no
/// record for this projection).
pub fn project_record(
    projection: &dyn DynProjection,
    aggregate_id: &AggregateId,
    events: &[SourcedEvent],
) -> Result<Option<ProjectionRecord>, ProjectionError> {
    if !subscribes(events, projection) {
        return Ok(None);
    }
    ensure_contiguous(events, 1)?;

    let data = projection.fold(None, events)?;
    Ok(Some(ProjectionRecord {
        aggregate_id: aggregate_id.clone(),
        projection: projection.name().to_string(),
        version: events.last().map(SourcedEvent::version).unwrap_or(0),
        data,
        updated_at: Utc::now(),
    }))
}

/// Apply newly committed events on top of the existing record.
pub fn project_incremental(
    projection: &dyn DynProjection,
    aggregate_id: &AggregateId,
    existing: Option<&ProjectionRecord>,
    new_events: &[SourcedEvent],
) -> Result<Incremental, ProjectionError> {
    let applied = existing.map(|r| r.version).unwrap_or(0);
    let fresh: Vec<SourcedEvent> = new_events
        .iter()
        .filter(|e| e.version() > applied)
        .cloned()
        .collect();

    let Some(first) = fresh.first() else {
        return Ok(Incremental::Unchanged);
    };
    if first.version() != applied + 1 {
        return Ok(Incremental::NeedsReplay {
            expected: applied + 1,
            found: first.version(),
        });
    }
    if let Err(ProjectionError::Gap { expected, found }) = ensure_contiguous(&fresh, applied + 1) {
        return Ok(Incremental::NeedsReplay { expected, found });
    }
    if existing.is_none() && !subscribes(&fresh, projection) {
        return Ok(Incremental::Unchanged);
    }

    let data = projection.fold(existing.map(|r| &r.data), &fresh)?;
    let version = fresh.last().map(SourcedEvent::version).unwrap_or(applied);
    Ok(Incremental::Updated(ProjectionRecord {
        aggregate_id: aggregate_id.clone(),
        projection: projection.name().to_string(),
        version,
        data,
        updated_at: Utc::now(),
    }))
}

fn ensure_contiguous(events: &[SourcedEvent], start: u64) -> Result<(), ProjectionError> {
    for (expected, event) in (start..).zip(events) {
        if event.version() != expected {
            return Err(ProjectionError::Gap {
                expected,
                found: event.version(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ProjectionMode;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Lines {
        seen: Vec<u64>,
    }

    struct LinesProjection;

    impl Projection for LinesProjection {
        type Model = Lines;

        fn name(&self) -> &'static str {
            "lines"
        }

        fn mode(&self) -> ProjectionMode {
            ProjectionMode::Consistent
        }

        fn subscribes_to(&self, event_type: &str) -> bool {
            event_type == "line"
        }

        fn apply(&self, model: &mut Lines, event: &SourcedEvent) -> Result<(), ProjectionError> {
            model.seen.push(event.version());
            Ok(())
        }
    }

    fn ev(event_type: &str, version: u64) -> SourcedEvent {
        SourcedEvent::from_parts(event_type, 1, version, Utc::now(), None, json!(null))
    }

    fn id() -> AggregateId {
        AggregateId::parse("e-1").unwrap()
    }

    #[test]
    fn project_is_a_pure_ordered_fold() {
        let events = vec![ev("line", 1), ev("noise", 2), ev("line", 3)];
        let a = project(&LinesProjection, &events).unwrap();
        let b = project(&LinesProjection, &events).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.seen, vec![1, 3]);
    }

    #[test]
    fn project_record_is_none_without_subscribed_events() {
        let record = project_record(&LinesProjection, &id(), &[ev("noise", 1)]).unwrap();
        assert!(record.is_none());
    }

    #[test]
    fn incremental_applies_only_new_versions() {
        let base = project_record(&LinesProjection, &id(), &[ev("line", 1), ev("line", 2)])
            .unwrap()
            .unwrap();

        let redelivered = vec![ev("line", 2), ev("line", 3)];
        let Incremental::Updated(next) =
            project_incremental(&LinesProjection, &id(), Some(&base), &redelivered).unwrap()
        else {
            panic!("expected an update");
        };

        assert_eq!(next.version, 3);
        assert_eq!(next.model::<Lines>().unwrap().seen, vec![1, 2, 3]);
    }

    #[test]
    fn incremental_is_unchanged_when_everything_was_applied() {
        let base = project_record(&LinesProjection, &id(), &[ev("line", 1)]).unwrap().unwrap();
        let out = project_incremental(&LinesProjection, &id(), Some(&base), &[ev("line", 1)]).unwrap();
        assert_eq!(out, Incremental::Unchanged);
    }

    #[test]
    fn incremental_reports_gap() {
        let base = project_record(&LinesProjection, &id(), &[ev("line", 1)]).unwrap().unwrap();
        let out = project_incremental(&LinesProjection, &id(), Some(&base), &[ev("line", 3)]).unwrap();
        assert_eq!(out, Incremental::NeedsReplay { expected: 2, found: 3 });
    }

    #[test]
    fn incremental_without_record_and_history_needs_replay() {
        let out = project_incremental(&LinesProjection, &id(), None, &[ev("line", 2)]).unwrap();
        assert_eq!(out, Incremental::NeedsReplay { expected: 1, found: 2 });
    }

    #[test]
    fn incremental_equals_full_replay() {
        let all = vec![ev("line", 1), ev("noise", 2), ev("line", 3), ev("line", 4)];
        let full = project_record(&LinesProjection, &id(), &all).unwrap().unwrap();

        let first = project_record(&LinesProjection, &id(), &all[..2]).unwrap().unwrap();
        let Incremental::Updated(inc) =
            project_incremental(&LinesProjection, &id(), Some(&first), &all[2..]).unwrap()
        else {
            panic!("expected an update");
        };

        assert_eq!(inc.data, full.data);
        assert_eq!(inc.version, full.version);
    }
}
