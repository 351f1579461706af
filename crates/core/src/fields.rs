//! Versioned field extraction and content hashing.
//!
//! Only the fields listed in the schema below take part in sync. Raw
//! documents from either side are normalized into a canonical document
//! whose references are expressed as remote ids, so a local and a remote
//! hash of the same content are equal. Unknown fields are ignored and
//! missing or mistyped ones take the type's default.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::DatabaseError;
use crate::mapping::MappingStore;
use crate::models::EntityType;

/// Bumping this invalidates every stored hash.
pub const FIELD_SCHEMA_VERSION: u32 = 1;

/// A normalized field document.
pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    NullableText,
    Bool,
    Integer,
    /// Id of another entity.
    Ref(EntityType),
    /// Set of ids of other entities.
    RefSet(EntityType),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

static LABEL_FIELDS: &[FieldSpec] = &[
    field("name", FieldKind::Text),
    field("color", FieldKind::Text),
];

static LIST_FIELDS: &[FieldSpec] = &[
    field("name", FieldKind::Text),
    field("color", FieldKind::Text),
];

static TASK_FIELDS: &[FieldSpec] = &[
    field("title", FieldKind::Text),
    field("description", FieldKind::Text),
    field("completed", FieldKind::Bool),
    field("due_date", FieldKind::NullableText),
    field("priority", FieldKind::Integer),
    field("list_id", FieldKind::Ref(EntityType::List)),
    field("label_ids", FieldKind::RefSet(EntityType::Label)),
];

/// Synchronizable fields of an entity type.
pub fn schema(entity_type: EntityType) -> &'static [FieldSpec] {
    match entity_type {
        EntityType::Label => LABEL_FIELDS,
        EntityType::List => LIST_FIELDS,
        EntityType::Task => TASK_FIELDS,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize(kind: FieldKind, value: Option<&Value>) -> Value {
    match kind {
        FieldKind::Text => match value {
            Some(Value::String(s)) => Value::String(s.clone()),
            _ => Value::String(String::new()),
        },
        FieldKind::NullableText => match value {
            Some(Value::String(s)) if !s.is_empty() => Value::String(s.clone()),
            _ => Value::Null,
        },
        FieldKind::Bool => Value::Bool(matches!(value, Some(Value::Bool(true)))),
        FieldKind::Integer => {
            let n = value
                .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                .unwrap_or(0);
            Value::from(n)
        }
        FieldKind::Ref(_) => value
            .and_then(id_string)
            .map(Value::String)
            .unwrap_or(Value::Null),
        FieldKind::RefSet(_) => {
            let ids: BTreeSet<String> = match value {
                Some(Value::Array(items)) => items.iter().filter_map(id_string).collect(),
                _ => BTreeSet::new(),
            };
            Value::Array(ids.into_iter().map(Value::String).collect())
        }
    }
}

/// Normalize a raw document to the schema without translating references.
pub fn extract(entity_type: EntityType, raw: &Map<String, Value>) -> Fields {
    schema(entity_type)
        .iter()
        .map(|spec| (spec.name.to_string(), normalize(spec.kind, raw.get(spec.name))))
        .collect()
}

/// SHA-256 (hex) over the versioned canonical JSON of `fields`.
pub fn content_hash(fields: &Fields) -> String {
    // Sorted explicitly so the digest never depends on map ordering.
    let sorted: BTreeMap<&str, &Value> = fields.iter().map(|(k, v)| (k.as_str(), v)).collect();
    let canonical = serde_json::to_string(&sorted).unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(format!("v{}:", FIELD_SCHEMA_VERSION).as_bytes());
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Rewrite every reference in `fields` through `translate`; references it
/// cannot translate become null or are dropped from sets.
fn translate_refs<F>(
    entity_type: EntityType,
    mut fields: Fields,
    mut translate: F,
) -> Result<Fields, DatabaseError>
where
    F: FnMut(EntityType, &str) -> Result<Option<String>, DatabaseError>,
{
    for spec in schema(entity_type) {
        match spec.kind {
            FieldKind::Ref(target) => {
                let translated = match fields.get(spec.name).and_then(Value::as_str) {
                    Some(id) => translate(target, id)?,
                    None => None,
                };
                fields.insert(
                    spec.name.to_string(),
                    translated.map(Value::String).unwrap_or(Value::Null),
                );
            }
            FieldKind::RefSet(target) => {
                let mut out = BTreeSet::new();
                if let Some(Value::Array(items)) = fields.get(spec.name) {
                    for id in items.iter().filter_map(Value::as_str) {
                        if let Some(mapped) = translate(target, id)? {
                            out.insert(mapped);
                        }
                    }
                }
                fields.insert(
                    spec.name.to_string(),
                    Value::Array(out.into_iter().map(Value::String).collect()),
                );
            }
            _ => {}
        }
    }
    Ok(fields)
}

/// Canonical document for a local entity (local refs → remote ids).
pub fn canonical_from_local(
    mappings: &MappingStore<'_>,
    entity_type: EntityType,
    raw: &Map<String, Value>,
) -> Result<Fields, DatabaseError> {
    translate_refs(entity_type, extract(entity_type, raw), |target, id| {
        Ok(mappings
            .get(target, id)?
            .filter(|m| m.is_live())
            .map(|m| m.remote_id))
    })
}

/// Canonical document for a remote entity (unmapped refs dropped).
pub fn canonical_from_remote(
    mappings: &MappingStore<'_>,
    entity_type: EntityType,
    raw: &Map<String, Value>,
) -> Result<Fields, DatabaseError> {
    translate_refs(entity_type, extract(entity_type, raw), |target, id| {
        Ok(mappings
            .get_by_remote(target, id)?
            .filter(|m| m.is_live())
            .map(|m| m.remote_id))
    })
}

/// Local document for a canonical one (remote refs → local ids).
pub fn to_local(
    mappings: &MappingStore<'_>,
    entity_type: EntityType,
    canonical: &Fields,
) -> Result<Fields, DatabaseError> {
    translate_refs(entity_type, extract(entity_type, canonical), |target, id| {
        Ok(mappings
            .get_by_remote(target, id)?
            .filter(|m| m.is_live())
            .map(|m| m.local_id))
    })
}
