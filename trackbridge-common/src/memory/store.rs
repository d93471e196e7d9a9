use crate::query::Query;
use crate::store::{Fields, Record, RemoteStore, ENTITY_TYPE_KEY};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum reference hops followed when resolving a dotted path
const MAX_DEPTH: usize = 8;

/// Polymorphic type matching every project-tree entity below a Project
const TYPED_CONTEXT: &str = "TypedContext";

const TYPED_CONTEXT_SUBTYPES: &[&str] = &[
    "Folder",
    "Episode",
    "Sequence",
    "Shot",
    "AssetBuild",
    "Task",
    "Milestone",
];

enum PendingOp {
    Create(Record),
    Update {
        entity_type: String,
        id: String,
        fields: Fields,
    },
}

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Record>>,
    schemas: HashMap<String, HashSet<String>>,
    hidden_reads: HashMap<String, u32>,
    fail_next_create: Option<String>,
    fail_next_commit: Option<String>,
    commits: usize,
    rollbacks: usize,
    queries: usize,
}

impl State {
    fn find(&self, entity_type: &str, id: &str) -> Option<&Record> {
        self.tables
            .get(entity_type)
            .and_then(|rows| rows.iter().find(|r| r.id == id))
    }

    fn follow(&self, value: &Value) -> Option<&Record> {
        let entity_type = value.get(ENTITY_TYPE_KEY)?.as_str()?;
        let id = value.get("id")?.as_str()?;
        self.find(entity_type, id)
    }

    /// Related record for one path segment, deriving `project` from the parent chain
    fn related(&self, record: &Record, segment: &str, depth: usize) -> Option<&Record> {
        if depth > MAX_DEPTH {
            return None;
        }
        if let Some(value) = record.fields.get(segment) {
            return self.follow(value);
        }
        if segment == "project" {
            let parent = record.fields.get("parent").and_then(|p| self.follow(p))?;
            if parent.entity_type == "Project" {
                return Some(parent);
            }
            return self.related(parent, "project", depth + 1);
        }
        None
    }

    fn resolve(&self, record: &Record, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = record;
        for (i, segment) in segments.iter().enumerate() {
            let last = i == segments.len() - 1;
            if last {
                if *segment == "id" {
                    return Some(Value::String(current.id.clone()));
                }
                return current
                    .fields
                    .get(*segment)
                    .cloned()
                    .or_else(|| self.related(current, segment, 0).map(Record::reference));
            }
            current = self.related(current, segment, 0)?;
        }
        None
    }

    fn project_into(&self, record: &Record, segments: &[&str], out: &mut Map<String, Value>, depth: usize) {
        let Some((first, rest)) = segments.split_first() else {
            return;
        };
        if rest.is_empty() {
            if let Some(value) = self.resolve(record, first) {
                if *first != "id" {
                    out.insert(first.to_string(), value);
                }
            }
            return;
        }
        if depth > MAX_DEPTH {
            return;
        }
        let Some(target) = self.related(record, first, 0) else {
            return;
        };
        let entry = out
            .entry(first.to_string())
            .or_insert_with(|| target.reference());
        if let Value::Object(nested) = entry {
            self.project_into(target, rest, nested, depth + 1);
        }
    }

    fn materialize(&self, record: &Record, projections: &[String]) -> Record {
        let mut fields = record.fields.clone();
        for projection in projections {
            let segments: Vec<&str> = projection.split('.').collect();
            if segments.len() > 1 {
                self.project_into(record, &segments, &mut fields, 0);
            } else if !fields.contains_key(projection) {
                if let Some(value) = self.resolve(record, projection) {
                    if projection != "id" {
                        fields.insert(projection.clone(), value);
                    }
                }
            }
        }
        Record::new(record.entity_type.clone(), record.id.clone(), fields)
    }
}

/// In-process [`RemoteStore`]
///
/// Committed tables are shared by every session of one server. Each session
/// stages its own batch, so committing or rolling back one session leaves
/// the others' staged work alone.
pub struct MemoryStore {
    name: String,
    state: Arc<Mutex<State>>,
    pending: Mutex<Vec<PendingOp>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(State::default())),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// New session on the same server with an empty batch
    pub fn session(&self) -> Self {
        Self {
            name: self.name.clone(),
            state: Arc::clone(&self.state),
            pending: Mutex::new(Vec::new()),
        }
    }

    // A panic while holding either lock leaves plain data behind; keep using it.
    // Lock order is state, then pending.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingOp>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert a committed entity directly, bypassing the pending batch
    pub fn insert(&self, entity_type: &str, fields: Value) -> Record {
        let mut fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        fields.remove(ENTITY_TYPE_KEY);
        let record = Record::new(entity_type, id, fields);
        self.lock()
            .tables
            .entry(entity_type.to_string())
            .or_default()
            .push(record.clone());
        record
    }

    /// Declare that the schema of `entity_type` has `property`
    pub fn declare_property(&self, entity_type: &str, property: &str) {
        self.lock()
            .schemas
            .entry(entity_type.to_string())
            .or_default()
            .insert(property.to_string());
    }

    /// Hide an entity from the next `reads` queries that would match it
    pub fn hide_for_reads(&self, id: &str, reads: u32) {
        self.lock().hidden_reads.insert(id.to_string(), reads);
    }

    pub fn fail_next_create(&self, reason: &str) {
        self.lock().fail_next_create = Some(reason.to_string());
    }

    pub fn fail_next_commit(&self, reason: &str) {
        self.lock().fail_next_commit = Some(reason.to_string());
    }

    /// Committed entities of one type, in insertion order
    pub fn all(&self, entity_type: &str) -> Vec<Record> {
        self.lock().tables.get(entity_type).cloned().unwrap_or_default()
    }

    pub fn count(&self, entity_type: &str) -> usize {
        self.lock().tables.get(entity_type).map_or(0, Vec::len)
    }

    pub fn find(&self, entity_type: &str, id: &str) -> Option<Record> {
        self.lock().find(entity_type, id).cloned()
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    pub fn rollback_count(&self) -> usize {
        self.lock().rollbacks
    }

    pub fn query_count(&self) -> usize {
        self.lock().queries
    }

    /// Operations staged by this session
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: &Query) -> Result<Vec<Record>> {
        let mut state = self.lock();
        state.queries += 1;

        let types: Vec<&str> = if query.entity_type == TYPED_CONTEXT {
            TYPED_CONTEXT_SUBTYPES.to_vec()
        } else {
            vec![query.entity_type.as_str()]
        };
        let matching: Vec<Record> = types
            .iter()
            .filter_map(|t| state.tables.get(*t))
            .flatten()
            .filter(|r| query.filter.matches(&|path: &str| state.resolve(r, path)))
            .cloned()
            .collect();

        let mut visible = Vec::new();
        for record in matching {
            if let Some(remaining) = state.hidden_reads.get_mut(&record.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    continue;
                }
            }
            visible.push(state.materialize(&record, &query.projections));
            if query.limit.is_some_and(|limit| visible.len() >= limit) {
                break;
            }
        }
        Ok(visible)
    }

    async fn create(&self, entity_type: &str, mut fields: Fields) -> Result<Record> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_create.take() {
            return Err(Error::Create(reason));
        }
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let record = Record::new(entity_type, id, fields);
        self.lock_pending().push(PendingOp::Create(record.clone()));
        Ok(record)
    }

    async fn update(&self, entity_type: &str, id: &str, fields: Fields) -> Result<()> {
        self.lock_pending().push(PendingOp::Update {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
            fields,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(reason) = state.fail_next_commit.take() {
            return Err(Error::Commit(reason));
        }

        // Apply to a copy so a bad update leaves nothing half-written.
        // Updates may target entities created earlier in the same batch.
        let mut pending = self.lock_pending();
        let mut tables = state.tables.clone();
        for op in pending.iter() {
            match op {
                PendingOp::Create(record) => {
                    tables
                        .entry(record.entity_type.clone())
                        .or_default()
                        .push(record.clone());
                }
                PendingOp::Update {
                    entity_type,
                    id,
                    fields,
                } => {
                    let target = tables
                        .get_mut(entity_type)
                        .and_then(|rows| rows.iter_mut().find(|r| &r.id == id))
                        .ok_or_else(|| Error::Commit(format!("{} {} does not exist", entity_type, id)))?;
                    target.fields.extend(fields.clone());
                }
            }
        }
        state.tables = tables;
        pending.clear();
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&self) {
        let mut state = self.lock();
        self.lock_pending().clear();
        state.rollbacks += 1;
    }

    async fn has_property(&self, entity_type: &str, property: &str) -> Result<bool> {
        Ok(self
            .lock()
            .schemas
            .get(entity_type)
            .is_some_and(|props| props.contains(property)))
    }
}
