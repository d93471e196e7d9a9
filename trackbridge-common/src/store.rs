//! Remote entity store abstraction
//!
//! A [`RemoteStore`] is one session against one tracking server. Creates and
//! updates are staged in a pending batch until [`RemoteStore::commit`];
//! [`RemoteStore::rollback`] discards the batch. Field values are JSON
//! scalars, datetimes (`{"__type__": "datetime", ...}`) or references to other
//! entities (`{"__entity_type__": T, "id": I}`), never client-side object
//! graphs.

use crate::query::Query;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Field map sent with create and update operations
pub type Fields = Map<String, Value>;

/// Key carrying the entity type in wire payloads
pub const ENTITY_TYPE_KEY: &str = "__entity_type__";

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One entity as returned by a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub entity_type: String,
    pub id: String,
    /// Projected attributes; related entities appear as nested objects
    pub fields: Fields,
}

impl Record {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>, fields: Fields) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            fields,
        }
    }

    /// Build a record from a wire object carrying `__entity_type__` and `id`
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::Protocol("entity payload is not an object".to_string()));
        };

        let entity_type = match map.remove(ENTITY_TYPE_KEY) {
            Some(Value::String(t)) => t,
            _ => return Err(Error::Protocol("entity payload lacks __entity_type__".to_string())),
        };
        let id = match map.remove("id") {
            Some(Value::String(id)) => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(Error::Protocol(format!("{} payload lacks an id", entity_type))),
        };

        Ok(Self::new(entity_type, id, map))
    }

    /// Wire representation including type and id
    pub fn to_json(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert(ENTITY_TYPE_KEY.to_string(), Value::String(self.entity_type.clone()));
        map.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(map)
    }

    /// Reference value pointing at this record
    pub fn reference(&self) -> Value {
        entity_ref(&self.entity_type, &self.id)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        if key == "id" {
            return None;
        }
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Integer field; a float counts only when it is whole and fits
    pub fn i64(&self, key: &str) -> Option<i64> {
        let value = self.get(key)?;
        value.as_i64().or_else(|| {
            let f = value.as_f64()?;
            (f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64).then_some(f as i64)
        })
    }

    /// Follow a dotted path through nested related entities
    pub fn path(&self, dotted: &str) -> Option<&Value> {
        let mut parts = dotted.split('.');
        let mut current = self.get(parts.next()?)?;
        for part in parts {
            current = current.get(part).filter(|v| !v.is_null())?;
        }
        Some(current)
    }

    pub fn path_str(&self, dotted: &str) -> Option<&str> {
        self.path(dotted).and_then(Value::as_str)
    }
}

/// Reference value for an entity
pub fn entity_ref(entity_type: &str, id: &str) -> Value {
    json!({ ENTITY_TYPE_KEY: entity_type, "id": id })
}

/// Id of a reference (or nested entity) value
pub fn ref_id(value: &Value) -> Option<&str> {
    value.get("id").and_then(Value::as_str)
}

/// Encode a datetime field value
pub fn datetime_value(dt: NaiveDateTime) -> Value {
    json!({ "__type__": "datetime", "value": dt.format(DATETIME_FORMAT).to_string() })
}

/// Decode a datetime field value, accepting the tagged form or a bare string
pub fn parse_datetime(value: &Value) -> Option<NaiveDateTime> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(_) => value.get("value")?.as_str()?,
        _ => return None,
    };
    // Servers may append fractional seconds or an offset
    let trimmed = raw.get(..19).unwrap_or(raw);
    NaiveDateTime::parse_from_str(trimmed, DATETIME_FORMAT).ok()
}

/// One session against one tracking server
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Display name of the server this session belongs to
    fn server_name(&self) -> &str;

    /// Run a query; an empty result is not an error
    async fn query(&self, query: &Query) -> Result<Vec<Record>>;

    /// First match of a query
    async fn query_first(&self, query: &Query) -> Result<Option<Record>> {
        let limited = query.clone().limit(1);
        Ok(self.query(&limited).await?.into_iter().next())
    }

    /// Fetch one entity by id with the given projections
    async fn get(&self, entity_type: &str, id: &str, projections: &[&str]) -> Result<Option<Record>> {
        let query = Query::by_id(entity_type, id).select(projections.iter().copied());
        self.query_first(&query).await
    }

    /// Stage a create; the returned record carries the id assigned to it
    async fn create(&self, entity_type: &str, fields: Fields) -> Result<Record>;

    /// Stage an update of an existing entity
    async fn update(&self, entity_type: &str, id: &str, fields: Fields) -> Result<()>;

    /// Send every staged operation as one batch
    async fn commit(&self) -> Result<()>;

    /// Discard every staged operation
    async fn rollback(&self);

    /// Whether the server schema declares `property` on `entity_type`
    async fn has_property(&self, entity_type: &str, property: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_record_from_json_and_paths() {
        let record = Record::from_json(json!({
            "__entity_type__": "Task",
            "id": "t-1",
            "name": "charA",
            "project": {"__entity_type__": "Project", "id": "p-1", "full_name": "DEMO"}
        }))
        .unwrap();

        assert_eq!(record.entity_type, "Task");
        assert_eq!(record.str("name"), Some("charA"));
        assert_eq!(record.path_str("project.full_name"), Some("DEMO"));
        assert!(record.path("project.missing").is_none());
    }

    #[test]
    fn test_i64_rejects_fractional_numbers() {
        let record = Record::from_json(json!({
            "__entity_type__": "AssetVersion",
            "id": "v-1",
            "version": 7,
            "whole": 3.0,
            "fraction": 2.5,
            "huge": 1e300,
        }))
        .unwrap();

        assert_eq!(record.i64("version"), Some(7));
        assert_eq!(record.i64("whole"), Some(3));
        assert_eq!(record.i64("fraction"), None);
        assert_eq!(record.i64("huge"), None);
        assert_eq!(record.i64("missing"), None);
    }

    #[test]
    fn test_record_from_json_rejects_untyped() {
        assert!(Record::from_json(json!({"id": "x"})).is_err());
        assert!(Record::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_datetime_roundtrip_forms() {
        let dt = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(parse_datetime(&datetime_value(dt)), Some(dt));
        assert_eq!(parse_datetime(&json!("2024-03-01T09:30:00.000+00:00")), Some(dt));
        assert_eq!(parse_datetime(&json!(42)), None);
    }
}
