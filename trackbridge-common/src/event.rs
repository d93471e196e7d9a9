//! Normalized hub events
//!
//! Hub payloads are loosely shaped maps whose key names and casing vary
//! between server versions (`entity_type` vs `entityType`, `entityId` vs
//! `id`, "task" vs "Task"). [`normalize`] converts a [`RawEvent`] into typed
//! [`Event`] values at the hub boundary; nothing past that point reads the
//! raw map again.

use crate::hub::RawEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Entity kinds the listeners care about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Task,
    Note,
    AssetVersion,
    Shot,
    /// Any other entity type, lowercased as delivered
    Other(String),
}

impl EntityKind {
    /// Parse a vendor entity-type string, case-insensitively
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "task" => EntityKind::Task,
            "note" => EntityKind::Note,
            "assetversion" | "asset_version" => EntityKind::AssetVersion,
            "shot" => EntityKind::Shot,
            other => EntityKind::Other(other.to_string()),
        }
    }

    /// Entity type name as used in store queries
    pub fn type_name(&self) -> &str {
        match self {
            EntityKind::Task => "Task",
            EntityKind::Note => "Note",
            EntityKind::AssetVersion => "AssetVersion",
            EntityKind::Shot => "Shot",
            EntityKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Lifecycle action reported by the hub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Add,
    Update,
    Remove,
}

impl Action {
    /// Parse a vendor action string; unknown actions yield `None`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "add" | "create" | "created" => Some(Action::Add),
            "update" | "updated" => Some(Action::Update),
            "remove" | "delete" | "deleted" => Some(Action::Remove),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Remove => "remove",
        };
        f.write_str(s)
    }
}

/// One entity change, immutable once built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub entity_kind: EntityKind,
    pub action: Action,
    pub entity_id: String,
}

impl Event {
    pub fn new(
        topic: impl Into<String>,
        entity_kind: EntityKind,
        action: Action,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            entity_kind,
            action,
            entity_id: entity_id.into(),
        }
    }
}

fn first_str<'a>(entity: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| entity.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Normalize a single entry of `data.entities`
///
/// Returns `None` when the entry lacks an id, a type or a known action.
pub fn normalize_entity(topic: &str, entity: &Value) -> Option<Event> {
    let entity_type = first_str(entity, &["entity_type", "entityType"])?;
    let action = Action::parse(first_str(entity, &["action", "operation"])?)?;
    let entity_id = first_str(entity, &["entityId", "entity_id", "id"])?;

    Some(Event::new(
        topic,
        EntityKind::parse(entity_type),
        action,
        entity_id,
    ))
}

/// Convert a raw hub event into zero or more typed events
pub fn normalize(raw: &RawEvent) -> Vec<Event> {
    raw.data
        .get("entities")
        .and_then(Value::as_array)
        .map(|entities| {
            entities
                .iter()
                .filter_map(|entity| normalize_entity(&raw.topic, entity))
                .collect()
        })
        .unwrap_or_default()
}
