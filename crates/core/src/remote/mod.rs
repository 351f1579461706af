//! Seam to the external task provider.
//!
//! Provider payloads are untyped JSON. They travel through the engine as a
//! [`RemoteEnvelope`] tagged with its entity type; field extraction happens
//! later in [`crate::fields`], never by trusting the provider's structure.

pub mod http;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::RemoteApiError;
use crate::models::EntityType;

pub use http::HttpProvider;
pub use memory::MemoryProvider;
pub use retry::RetryPolicy;

/// Wire keys that carry envelope metadata rather than entity fields.
pub const ID_KEY: &str = "id";
pub const DELETED_KEY: &str = "deleted";
pub const CLIENT_REF_KEY: &str = "client_ref";

/// One entity as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEnvelope {
    pub entity_type: EntityType,
    pub remote_id: String,
    pub raw_fields: Map<String, Value>,
    /// Tombstone reported by a delta fetch.
    pub deleted: bool,
    /// Client reference echoed back by the provider (the local id we sent
    /// when creating it).
    pub stable_key: Option<String>,
}

impl RemoteEnvelope {
    /// Build an envelope from a provider JSON object. The `id` may be a
    /// string or a number; anything else is rejected.
    pub fn from_json(entity_type: EntityType, value: Value) -> Result<Self, RemoteApiError> {
        let Value::Object(mut raw) = value else {
            return Err(RemoteApiError::ParseError(format!(
                "expected a JSON object for {}",
                entity_type
            )));
        };

        let remote_id = match raw.remove(ID_KEY) {
            Some(Value::String(s)) if !s.is_empty() => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(RemoteApiError::ParseError(format!(
                    "{} without a usable id",
                    entity_type
                )))
            }
        };
        let deleted = matches!(raw.remove(DELETED_KEY), Some(Value::Bool(true)));
        let stable_key = match raw.remove(CLIENT_REF_KEY) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Self {
            entity_type,
            remote_id,
            raw_fields: raw,
            deleted,
            stable_key,
        })
    }
}

/// Result of one entity-type fetch.
#[derive(Debug, Clone, Default)]
pub struct RemoteBatch {
    pub entities: Vec<RemoteEnvelope>,
    /// Cursor to pass to the next fetch; `None` if the provider has no
    /// delta support.
    pub cursor: Option<String>,
    /// Whether `entities` only holds changes since the given cursor.
    pub is_delta: bool,
}

/// Operations the engine needs from a task provider.
///
/// `fields` passed to `create`/`update` are canonical documents in the
/// provider's identifier space.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Check that a token is accepted.
    async fn verify_token(&self, token: &str) -> Result<(), RemoteApiError>;

    /// Fetch all entities of a type, or only changes since `cursor`.
    async fn fetch(
        &self,
        token: &str,
        entity_type: EntityType,
        cursor: Option<&str>,
    ) -> Result<RemoteBatch, RemoteApiError>;

    async fn create(
        &self,
        token: &str,
        entity_type: EntityType,
        fields: &Map<String, Value>,
        stable_key: &str,
    ) -> Result<RemoteEnvelope, RemoteApiError>;

    async fn update(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<RemoteEnvelope, RemoteApiError>;

    /// Delete an entity. Deleting something already gone succeeds.
    async fn delete(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<(), RemoteApiError>;
}
