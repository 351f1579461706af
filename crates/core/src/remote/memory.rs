//! In-process task provider.
//!
//! Holds entities in memory with a logical clock so delta fetches can return
//! only what changed since a cursor. Failures can be injected per operation
//! and every call is counted, which is what the engine tests rely on.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{RemoteBatch, RemoteEnvelope, RemoteProvider};
use crate::errors::RemoteApiError;
use crate::models::EntityType;

/// Provider operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Verify,
    Fetch,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredEntity {
    fields: Map<String, Value>,
    stable_key: Option<String>,
    deleted: bool,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    tokens: HashSet<String>,
    delta_enabled: bool,
    clock: u64,
    next_id: u64,
    entities: BTreeMap<(EntityType, String), StoredEntity>,
    failures: HashMap<RemoteOp, VecDeque<(Option<EntityType>, RemoteApiError)>>,
    calls: HashMap<RemoteOp, u32>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn begin(
        &mut self,
        op: RemoteOp,
        token: &str,
        entity_type: Option<EntityType>,
    ) -> Result<(), RemoteApiError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if !self.tokens.contains(token) {
            return Err(RemoteApiError::Unauthorized { status: 401 });
        }
        if let Some(queue) = self.failures.get_mut(&op) {
            let pos = queue
                .iter()
                .position(|(only, _)| only.is_none() || *only == entity_type);
            if let Some(pos) = pos {
                if let Some((_, err)) = queue.remove(pos) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn envelope(&self, entity_type: EntityType, id: &str, stored: &StoredEntity) -> RemoteEnvelope {
        RemoteEnvelope {
            entity_type,
            remote_id: id.to_string(),
            raw_fields: stored.fields.clone(),
            deleted: stored.deleted,
            stable_key: stored.stable_key.clone(),
        }
    }
}

fn prefix(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Label => "L",
        EntityType::List => "P",
        EntityType::Task => "T",
    }
}

fn not_found(entity_type: EntityType, id: &str) -> RemoteApiError {
    RemoteApiError::ApiError {
        status: 404,
        body: format!("{} {} not found", entity_type, id),
    }
}

/// In-memory [`RemoteProvider`].
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<State>,
}

impl MemoryProvider {
    /// A provider accepting `token`, with delta fetches enabled.
    pub fn new(token: &str) -> Self {
        let mut state = State {
            delta_enabled: true,
            ..State::default()
        };
        state.tokens.insert(token.to_string());
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Turn changed-since support on or off.
    pub fn set_delta_enabled(&self, enabled: bool) {
        self.state().delta_enabled = enabled;
    }

    pub fn accept_token(&self, token: &str) {
        self.state().tokens.insert(token.to_string());
    }

    /// Stop accepting a token; calls with it fail with 401.
    pub fn revoke_token(&self, token: &str) {
        self.state().tokens.remove(token);
    }

    /// Create an entity on the provider side with a chosen id.
    pub fn insert_with_id(&self, entity_type: EntityType, id: &str, fields: Value) {
        let mut state = self.state();
        let version = state.tick();
        state.entities.insert(
            (entity_type, id.to_string()),
            StoredEntity {
                fields: fields.as_object().cloned().unwrap_or_default(),
                stable_key: None,
                deleted: false,
                version,
            },
        );
    }

    /// Create an entity on the provider side and return its id.
    pub fn insert(&self, entity_type: EntityType, fields: Value) -> String {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            format!("{}{}", prefix(entity_type), state.next_id)
        };
        self.insert_with_id(entity_type, &id, fields);
        id
    }

    /// Merge `patch` into an entity's fields, as an edit made elsewhere.
    pub fn edit(&self, entity_type: EntityType, id: &str, patch: Value) -> bool {
        let mut state = self.state();
        let version = state.tick();
        match state.entities.get_mut(&(entity_type, id.to_string())) {
            Some(stored) if !stored.deleted => {
                if let Value::Object(patch) = patch {
                    stored.fields.extend(patch);
                }
                stored.version = version;
                true
            }
            _ => false,
        }
    }

    /// Delete an entity provider-side, leaving a tombstone for delta fetches.
    pub fn remove(&self, entity_type: EntityType, id: &str) -> bool {
        let mut state = self.state();
        let version = state.tick();
        match state.entities.get_mut(&(entity_type, id.to_string())) {
            Some(stored) if !stored.deleted => {
                stored.deleted = true;
                stored.version = version;
                true
            }
            _ => false,
        }
    }

    /// Current fields of a live entity.
    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Map<String, Value>> {
        self.state()
            .entities
            .get(&(entity_type, id.to_string()))
            .filter(|s| !s.deleted)
            .map(|s| s.fields.clone())
    }

    /// Ids of live entities of a type.
    pub fn ids(&self, entity_type: EntityType) -> Vec<String> {
        self.state()
            .entities
            .iter()
            .filter(|((t, _), s)| *t == entity_type && !s.deleted)
            .map(|((_, id), _)| id.clone())
            .collect()
    }

    /// Fail the next call of `op` with the given HTTP status.
    pub fn fail_next(&self, op: RemoteOp, status: u16) {
        self.fail_next_with(op, None, RemoteApiError::from_status(status, "injected", None));
    }

    /// Fail the next call of `op` touching `entity_type` (or any type when
    /// `None`) with `err`.
    pub fn fail_next_with(&self, op: RemoteOp, entity_type: Option<EntityType>, err: RemoteApiError) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back((entity_type, err));
    }

    /// How many times `op` was called, failed calls included.
    pub fn calls(&self, op: RemoteOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteProvider for MemoryProvider {
    async fn verify_token(&self, token: &str) -> Result<(), RemoteApiError> {
        self.state().begin(RemoteOp::Verify, token, None)
    }

    async fn fetch(
        &self,
        token: &str,
        entity_type: EntityType,
        cursor: Option<&str>,
    ) -> Result<RemoteBatch, RemoteApiError> {
        let mut state = self.state();
        state.begin(RemoteOp::Fetch, token, Some(entity_type))?;

        let since = if state.delta_enabled {
            cursor.and_then(|c| c.parse::<u64>().ok())
        } else {
            None
        };
        let entities = state
            .entities
            .iter()
            .filter(|((t, _), _)| *t == entity_type)
            .filter(|(_, stored)| match since {
                Some(since) => stored.version > since,
                None => !stored.deleted,
            })
            .map(|((t, id), stored)| state.envelope(*t, id, stored))
            .collect();

        Ok(RemoteBatch {
            entities,
            cursor: state.delta_enabled.then(|| state.clock.to_string()),
            is_delta: since.is_some(),
        })
    }

    async fn create(
        &self,
        token: &str,
        entity_type: EntityType,
        fields: &Map<String, Value>,
        stable_key: &str,
    ) -> Result<RemoteEnvelope, RemoteApiError> {
        let mut state = self.state();
        state.begin(RemoteOp::Create, token, Some(entity_type))?;

        state.next_id += 1;
        let id = format!("{}{}", prefix(entity_type), state.next_id);
        let version = state.tick();
        let stored = StoredEntity {
            fields: fields.clone(),
            stable_key: Some(stable_key.to_string()),
            deleted: false,
            version,
        };
        let envelope = state.envelope(entity_type, &id, &stored);
        state.entities.insert((entity_type, id), stored);
        Ok(envelope)
    }

    async fn update(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<RemoteEnvelope, RemoteApiError> {
        let mut state = self.state();
        state.begin(RemoteOp::Update, token, Some(entity_type))?;

        let version = state.tick();
        let key = (entity_type, remote_id.to_string());
        let stored = match state.entities.get_mut(&key) {
            Some(stored) if !stored.deleted => stored,
            _ => return Err(not_found(entity_type, remote_id)),
        };
        stored
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        stored.version = version;
        let stored = stored.clone();
        Ok(state.envelope(entity_type, remote_id, &stored))
    }

    async fn delete(
        &self,
        token: &str,
        entity_type: EntityType,
        remote_id: &str,
    ) -> Result<(), RemoteApiError> {
        let mut state = self.state();
        state.begin(RemoteOp::Delete, token, Some(entity_type))?;

        let version = state.tick();
        if let Some(stored) = state.entities.get_mut(&(entity_type, remote_id.to_string())) {
            if !stored.deleted {
                stored.deleted = true;
                stored.version = version;
            }
        }
        Ok(())
    }
}
