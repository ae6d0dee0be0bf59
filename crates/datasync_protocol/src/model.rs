//! Models and their sync metadata.

use crate::error::{ProtocolError, ProtocolResult};
use crate::mutation::MutationType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const VERSION_FIELD: &str = "_version";
const DELETED_FIELD: &str = "_deleted";
const LAST_CHANGED_AT_FIELD: &str = "_lastChangedAt";
const TYPENAME_FIELD: &str = "__typename";

/// A type-erased model instance.
///
/// Models are generated elsewhere; the sync core only needs the model name,
/// the primary key and a JSON representation it can persist and send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyModel {
    /// Primary key of the instance.
    pub id: String,
    /// Name of the model type (for example `Post`).
    pub model_name: String,
    /// Field values, always a JSON object.
    pub instance: Value,
}

impl AnyModel {
    /// Creates a model from its parts.
    pub fn new(model_name: impl Into<String>, id: impl Into<String>, instance: Value) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            instance,
        }
    }

    /// Decodes a model from the JSON text persisted in a mutation event.
    ///
    /// The primary key is read from the `id` field of the object.
    pub fn from_json(model_name: &str, json: &str) -> ProtocolResult<Self> {
        let instance: Value =
            serde_json::from_str(json).map_err(|e| ProtocolError::decode(model_name, e))?;
        if !instance.is_object() {
            return Err(ProtocolError::decode(model_name, "model JSON is not an object"));
        }
        let id = instance
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("id"))?
            .to_string();
        Ok(Self {
            id,
            model_name: model_name.to_string(),
            instance,
        })
    }

    /// Serializes the field values to JSON text.
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(&self.instance).map_err(|e| ProtocolError::encode(&self.model_name, e))
    }

    /// Returns the value of a field, if present.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.instance.get(name)
    }
}

/// Sync bookkeeping stored alongside every synced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Primary key of the record this metadata describes.
    pub id: String,
    /// Model name of the record.
    pub model_name: String,
    /// Whether the record is deleted on the backend.
    pub deleted: bool,
    /// Backend timestamp of the last change, in milliseconds since the epoch.
    pub last_changed_at: i64,
    /// Optimistic concurrency version.
    pub version: u32,
}

impl SyncMetadata {
    /// Creates metadata for a live record.
    pub fn new(model_name: impl Into<String>, id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            model_name: model_name.into(),
            deleted: false,
            last_changed_at: Utc::now().timestamp_millis(),
            version,
        }
    }

    /// Marks the metadata as deleted.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Sets the last-changed timestamp.
    pub fn with_last_changed_at(mut self, last_changed_at: i64) -> Self {
        self.last_changed_at = last_changed_at;
        self
    }
}

/// A model paired with its sync metadata: the unit exchanged on the
/// reconciliation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSync<M = AnyModel> {
    /// The decoded model.
    pub model: M,
    /// Sync metadata reported by the backend.
    pub sync_metadata: SyncMetadata,
}

impl<M> MutationSync<M> {
    /// Pairs a model with its metadata.
    pub fn new(model: M, sync_metadata: SyncMetadata) -> Self {
        Self {
            model,
            sync_metadata,
        }
    }

    /// Infers the mutation that produced this state.
    ///
    /// Deleted records map to `Delete`, version 1 to `Create`, anything
    /// else to `Update`.
    pub fn mutation_type(&self) -> MutationType {
        if self.sync_metadata.deleted {
            MutationType::Delete
        } else if self.sync_metadata.version == 1 {
            MutationType::Create
        } else {
            MutationType::Update
        }
    }
}

impl MutationSync<AnyModel> {
    /// Decodes a backend object carrying model fields plus the `_version`,
    /// `_deleted`, `_lastChangedAt` and `__typename` sync fields.
    pub fn from_graphql_object(value: &Value) -> ProtocolResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::decode("MutationSync", "expected an object"))?;

        let model_name = object
            .get(TYPENAME_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField(TYPENAME_FIELD))?
            .to_string();
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("id"))?
            .to_string();
        let version = object
            .get(VERSION_FIELD)
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingField(VERSION_FIELD))?;
        let version =
            u32::try_from(version).map_err(|e| ProtocolError::decode(&model_name, e))?;
        let deleted = object
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let last_changed_at = object
            .get(LAST_CHANGED_AT_FIELD)
            .and_then(Value::as_i64)
            .unwrap_or_default();

        let fields: Map<String, Value> = object
            .iter()
            .filter(|(k, _)| !is_sync_field(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Self {
            model: AnyModel::new(model_name.clone(), id.clone(), Value::Object(fields)),
            sync_metadata: SyncMetadata {
                id,
                model_name,
                deleted,
                last_changed_at,
                version,
            },
        })
    }

    /// Encodes the model and metadata into a single backend object.
    pub fn to_graphql_object(&self) -> Value {
        let mut object = self.model.instance.as_object().cloned().unwrap_or_default();
        object.insert("id".into(), Value::String(self.model.id.clone()));
        object.insert(
            TYPENAME_FIELD.into(),
            Value::String(self.model.model_name.clone()),
        );
        object.insert(VERSION_FIELD.into(), Value::from(self.sync_metadata.version));
        object.insert(DELETED_FIELD.into(), Value::Bool(self.sync_metadata.deleted));
        object.insert(
            LAST_CHANGED_AT_FIELD.into(),
            Value::from(self.sync_metadata.last_changed_at),
        );
        Value::Object(object)
    }
}

fn is_sync_field(name: &str) -> bool {
    matches!(
        name,
        VERSION_FIELD | DELETED_FIELD | LAST_CHANGED_AT_FIELD | TYPENAME_FIELD
    )
}

/// Per-model checkpoint of the last completed historical sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSyncMetadata {
    /// Model name.
    pub model_name: String,
    /// Start time of the last successful sync, if any.
    pub last_sync: Option<DateTime<Utc>>,
}

impl ModelSyncMetadata {
    /// Creates a checkpoint.
    pub fn new(model_name: impl Into<String>, last_sync: Option<DateTime<Utc>>) -> Self {
        Self {
            model_name: model_name.into(),
            last_sync,
        }
    }
}
