use crate::config::ServerCredentials;
use crate::query::Query;
use crate::retry::{retry_until_found, RetryPolicy};
use crate::store::{Fields, Record, RemoteStore, ENTITY_TYPE_KEY};
use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("trackbridge/", env!("CARGO_PKG_VERSION"));

/// Session against a tracking server's JSON API
///
/// Creates and updates are staged locally and sent as one operation batch on
/// [`RemoteStore::commit`]; the server applies a batch atomically.
pub struct FtrackStore {
    credentials: ServerCredentials,
    http: reqwest::Client,
    endpoint: String,
    pending: Mutex<Vec<Value>>,
    schemas: HashMap<String, HashSet<String>>,
}

impl FtrackStore {
    /// Open a session, retrying transient failures per `policy`
    ///
    /// Fails with [`Error::Connection`] when the server stays unreachable or
    /// rejects the credentials; a listener must not run half-connected.
    pub async fn connect(credentials: ServerCredentials, policy: &RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::connection(&credentials.name, e.to_string()))?;

        let mut store = Self {
            endpoint: format!("{}/api", credentials.server_url),
            credentials,
            http,
            pending: Mutex::new(Vec::new()),
            schemas: HashMap::new(),
        };

        info!(server = %store.credentials.name, url = %store.credentials.server_url, user = %store.credentials.api_user, "Connecting to tracking server");

        let what = format!("session on {}", store.credentials.name);
        let startup = [json!({"action": "query_server_information"}), json!({"action": "query_schemas"})];
        let (session, operations) = (&store, &startup);
        let results = retry_until_found(&what, policy, || async move {
            session.call(operations, Error::Query).await.map(Some)
        })
        .await
        .map_err(|e| Error::connection(&store.credentials.name, e.to_string()))?;

        if let Some(version) = results.first().and_then(|info| info.get("version")) {
            info!(server = %store.credentials.name, version = %version, "Connected");
        }
        store.schemas = parse_schemas(results.get(1).unwrap_or(&Value::Null));
        debug!(server = %store.credentials.name, schemas = store.schemas.len(), "Loaded schemas");

        Ok(store)
    }

    /// POST an operation batch; `classify` maps server-side failures
    async fn call(&self, operations: &[Value], classify: fn(String) -> Error) -> Result<Vec<Value>> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("ftrack-user", &self.credentials.api_user)
            .header("ftrack-api-key", &self.credentials.api_key)
            .header("Accept", "application/json")
            .json(operations)
            .send()
            .await?;

        let status = response.status();
        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) if !status.is_success() => {
                return Err(classify(format!("HTTP {}: {}", status.as_u16(), e)))
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(exception) = body.get("exception").and_then(Value::as_str) {
            let content = body.get("content").and_then(Value::as_str).unwrap_or("");
            return Err(classify(format!("{}: {}", exception, content)));
        }
        if !status.is_success() {
            return Err(classify(format!("HTTP {}", status.as_u16())));
        }

        match body {
            Value::Array(results) => Ok(results),
            other => Err(Error::Protocol(format!("expected result array, got {}", other))),
        }
    }
}

fn parse_schemas(result: &Value) -> HashMap<String, HashSet<String>> {
    let entries = result
        .as_array()
        .or_else(|| result.get("data").and_then(Value::as_array));

    entries
        .into_iter()
        .flatten()
        .filter_map(|schema| {
            let id = schema.get("id")?.as_str()?.to_string();
            let properties = schema
                .get("properties")
                .and_then(Value::as_object)
                .map(|props| props.keys().cloned().collect())
                .unwrap_or_default();
            Some((id, properties))
        })
        .collect()
}

#[async_trait]
impl RemoteStore for FtrackStore {
    fn server_name(&self) -> &str {
        &self.credentials.name
    }

    async fn query(&self, query: &Query) -> Result<Vec<Record>> {
        let expression = query.render();
        debug!(server = %self.credentials.name, %expression, "Query");

        let results = self
            .call(&[json!({"action": "query", "expression": expression})], Error::Query)
            .await?;
        let data = results
            .into_iter()
            .next()
            .and_then(|r| r.get("data").cloned())
            .unwrap_or(Value::Array(Vec::new()));

        match data {
            Value::Array(rows) => rows.into_iter().map(Record::from_json).collect(),
            other => Err(Error::Protocol(format!("query data is not a list: {}", other))),
        }
    }

    async fn create(&self, entity_type: &str, mut fields: Fields) -> Result<Record> {
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let mut entity_data = fields.clone();
        entity_data.insert(ENTITY_TYPE_KEY.to_string(), json!(entity_type));
        entity_data.insert("id".to_string(), json!(id));

        self.pending.lock().await.push(json!({
            "action": "create",
            "entity_type": entity_type,
            "entity_data": entity_data,
        }));

        Ok(Record::new(entity_type, id, fields))
    }

    async fn update(&self, entity_type: &str, id: &str, fields: Fields) -> Result<()> {
        let mut entity_data = fields;
        entity_data.insert(ENTITY_TYPE_KEY.to_string(), json!(entity_type));

        self.pending.lock().await.push(json!({
            "action": "update",
            "entity_type": entity_type,
            "entity_key": [id],
            "entity_data": entity_data,
        }));
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let batch = self.pending.lock().await.clone();
        if batch.is_empty() {
            return Ok(());
        }

        debug!(server = %self.credentials.name, operations = batch.len(), "Commit");
        self.call(&batch, Error::Commit).await?;

        // Keep anything staged while the batch was in flight
        let mut pending = self.pending.lock().await;
        let sent = batch.len().min(pending.len());
        pending.drain(..sent);
        Ok(())
    }

    async fn rollback(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(server = %self.credentials.name, discarded = pending.len(), "Rollback");
        }
        pending.clear();
    }

    async fn has_property(&self, entity_type: &str, property: &str) -> Result<bool> {
        let properties = self
            .schemas
            .get(entity_type)
            .ok_or_else(|| Error::Schema(format!("no schema for {} on {}", entity_type, self.credentials.name)))?;
        Ok(properties.contains(property))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schemas_from_list() {
        let schemas = parse_schemas(&json!([
            {"id": "Note", "properties": {"content": {}, "recipients": {}}},
            {"id": "Task", "properties": {"name": {}}},
            {"properties": {}}
        ]));

        assert_eq!(schemas.len(), 2);
        assert!(schemas["Note"].contains("recipients"));
        assert!(!schemas["Task"].contains("recipients"));
    }

    #[test]
    fn test_parse_schemas_from_wrapped_result() {
        let schemas = parse_schemas(&json!({"action": "query_schemas", "data": [
            {"id": "Note", "properties": {"content": {}}}
        ]}));
        assert!(schemas.contains_key("Note"));
    }

    #[test]
    fn test_parse_schemas_tolerates_garbage() {
        assert!(parse_schemas(&Value::Null).is_empty());
    }
}
