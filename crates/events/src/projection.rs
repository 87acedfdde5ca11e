//! Projections: named derivations of read models from entity event streams.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use eventstorage_core::AggregateId;

use crate::event::{CodecError, SourcedEvent};

/// When a projection's record is computed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionMode {
    /// Persisted and kept current on every commit touching subscribed event types.
    Consistent,
    /// Never persisted; recomputed per query by replaying the full stream.
    Transient,
}

/// Where persisted projection records live.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionStore {
    /// The event store's own backend, written inside the commit unit of work.
    Relational,
    /// An alternate document/cache backend, kept current asynchronously.
    Document,
    /// Backfill-only: written by explicit restore and by catch-up.
    Selected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Decode(#[from] CodecError),

    #[error("projection '{projection}' failed to apply '{event_type}': {message}")]
    Apply {
        projection: String,
        event_type: String,
        message: String,
    },

    #[error("projection '{projection}' model (de)serialization failed: {message}")]
    Model { projection: String, message: String },

    #[error("version gap: expected {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    #[error("projection '{name}' is already registered")]
    Duplicate { name: String },
}

/// A read-model derivation.
///
/// `apply` must be deterministic and order-sensitive: the same events in the same
/// order always yield the same model. The engine never relies on `apply` being
/// idempotent; duplicate delivery is filtered by entity version before it is called.
///
/// Events of types the projection does not subscribe to are never passed to `apply`.
pub trait Projection: Send + Sync + 'static {
    type Model: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable name; also the model key of persisted records and the checkpoint subscription.
    fn name(&self) -> &'static str;

    fn mode(&self) -> ProjectionMode {
        ProjectionMode::Consistent
    }

    fn store(&self) -> ProjectionStore {
        ProjectionStore::Relational
    }

    fn subscribes_to(&self, event_type: &str) -> bool;

    fn apply(&self, model: &mut Self::Model, event: &SourcedEvent) -> Result<(), ProjectionError>;
}

/// Object-safe view of a `Projection` working on JSON-encoded models.
pub trait DynProjection: Send + Sync {
    fn name(&self) -> &'static str;
    fn mode(&self) -> ProjectionMode;
    fn store(&self) -> ProjectionStore;
    fn subscribes_to(&self, event_type: &str) -> bool;
    fn model_type(&self) -> TypeId;

    /// Fold `events` (subscribed ones only) onto `seed`, or onto the zero model.
    fn fold(&self, seed: Option<&JsonValue>, events: &[SourcedEvent]) -> Result<JsonValue, ProjectionError>;
}

impl<P: Projection> DynProjection for P {
    fn name(&self) -> &'static str {
        Projection::name(self)
    }

    fn mode(&self) -> ProjectionMode {
        Projection::mode(self)
    }

    fn store(&self) -> ProjectionStore {
        Projection::store(self)
    }

    fn subscribes_to(&self, event_type: &str) -> bool {
        Projection::subscribes_to(self, event_type)
    }

    fn model_type(&self) -> TypeId {
        TypeId::of::<P::Model>()
    }

    fn fold(&self, seed: Option<&JsonValue>, events: &[SourcedEvent]) -> Result<JsonValue, ProjectionError> {
        let model_error = |e: serde_json::Error| ProjectionError::Model {
            projection: Projection::name(self).to_string(),
            message: e.to_string(),
        };

        let mut model = match seed {
            Some(data) => P::Model::deserialize(data).map_err(model_error)?,
            None => P::Model::default(),
        };
        for event in events.iter().filter(|e| Projection::subscribes_to(self, e.event_type())) {
            Projection::apply(self, &mut model, event)?;
        }
        serde_json::to_value(&model).map_err(model_error)
    }
}

/// A persisted projection row: one per (entity, projection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRecord {
    pub aggregate_id: AggregateId,
    pub projection: String,
    /// Last entity version folded into `data`.
    pub version: u64,
    pub data: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl ProjectionRecord {
    pub fn global_id(&self) -> Uuid {
        self.aggregate_id.global_id()
    }

    /// Decode the stored model.
    pub fn model<M: DeserializeOwned>(&self) -> Result<M, ProjectionError> {
        M::deserialize(&self.data).map_err(|e| ProjectionError::Model {
            projection: self.projection.clone(),
            message: e.to_string(),
        })
    }
}

/// Projections known to a store, addressable by name and by model type.
#[derive(Default, Clone)]
pub struct ProjectionRegistry {
    projections: Vec<Arc<dyn DynProjection>>,
    by_name: HashMap<&'static str, usize>,
    by_model: HashMap<TypeId, usize>,
}

impl core::fmt::Debug for ProjectionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.projections.iter().map(|p| (p.name(), p.mode(), p.store())))
            .finish()
    }
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection. Names and model types must be unique.
    pub fn register<P: Projection>(&mut self, projection: P) -> Result<&mut Self, ProjectionError> {
        let name = Projection::name(&projection);
        let model = TypeId::of::<P::Model>();
        if self.by_name.contains_key(name) || self.by_model.contains_key(&model) {
            return Err(ProjectionError::Duplicate { name: name.to_string() });
        }

        let index = self.projections.len();
        self.projections.push(Arc::new(projection));
        self.by_name.insert(name, index);
        self.by_model.insert(model, index);
        Ok(self)
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn DynProjection>> {
        self.by_name.get(name).map(|&i| &self.projections[i])
    }

    pub fn for_model<M: 'static>(&self) -> Option<&Arc<dyn DynProjection>> {
        self.by_model.get(&TypeId::of::<M>()).map(|&i| &self.projections[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DynProjection>> {
        self.projections.iter()
    }

    /// Projections with persisted records (everything but transient ones).
    pub fn persisted(&self) -> impl Iterator<Item = &Arc<dyn DynProjection>> {
        self.projections
            .iter()
            .filter(|p| p.mode() == ProjectionMode::Consistent)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.projections.iter().map(|p| p.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }
}
