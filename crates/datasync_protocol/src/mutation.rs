//! Mutation events: the durable record of one pending local write.

use crate::error::{ProtocolError, ProtocolResult};
use crate::model::AnyModel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of local write captured by a [`MutationEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    /// A new record was created.
    Create,
    /// An existing record was updated.
    Update,
    /// A record was deleted.
    Delete,
}

impl MutationType {
    /// Returns the lowercase name used in persisted events.
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::Create => "create",
            MutationType::Update => "update",
            MutationType::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationType::Create),
            "update" => Ok(MutationType::Update),
            "delete" => Ok(MutationType::Delete),
            other => Err(ProtocolError::UnknownMutationType(other.to_string())),
        }
    }
}

/// A durably queued representation of one pending local write.
///
/// Created by the ingester on every local write, flagged `in_process`
/// while a delivery is in flight, and deleted once the backend
/// acknowledges it.
///
/// # Invariants
///
/// - Events for one model instance reach the backend in `created_at` order
/// - `json` always holds the serialized model, including for deletes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// Primary key of the mutated model.
    pub model_id: String,
    /// Model type name.
    pub model_name: String,
    /// Serialized model.
    pub json: String,
    /// Kind of write.
    pub mutation_type: MutationType,
    /// Creation timestamp, used to order the outbox.
    pub created_at: DateTime<Utc>,
    /// Version the write was based on, if the record has synced before.
    pub version: Option<u32>,
    /// Whether a delivery of this event is currently in flight.
    pub in_process: bool,
}

impl MutationEvent {
    /// Creates a new event stamped with the current time.
    pub fn new(
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        json: impl Into<String>,
        mutation_type: MutationType,
        version: Option<u32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.into(),
            model_name: model_name.into(),
            json: json.into(),
            mutation_type,
            created_at: Utc::now(),
            version,
            in_process: false,
        }
    }

    /// Creates an event capturing a write of `model`.
    pub fn from_model(
        model: &AnyModel,
        mutation_type: MutationType,
        version: Option<u32>,
    ) -> ProtocolResult<Self> {
        Ok(Self::new(
            model.id.clone(),
            model.model_name.clone(),
            model.to_json()?,
            mutation_type,
            version,
        ))
    }

    /// Overrides the creation timestamp.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Decodes the serialized model.
    pub fn decode_model(&self) -> ProtocolResult<AnyModel> {
        let model = AnyModel::from_json(&self.model_name, &self.json)?;
        if model.id != self.model_id {
            return Err(ProtocolError::decode(
                &self.model_name,
                format!("model id {} does not match event {}", model.id, self.model_id),
            ));
        }
        Ok(model)
    }
}
