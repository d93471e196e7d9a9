//! "Create Project from Copy" action
//!
//! Answers `ftrack.action.discover` with one action item. A launch without
//! form values gets a form listing every project; a launch with values
//! clones the chosen project's tree under a new name, tracked by a Job.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trackbridge_common::config::ProjectCopySettings;
use trackbridge_common::store::{datetime_value, parse_datetime, Fields};
use trackbridge_common::{
    Connector, Error, EventHub, Filter, Listener, Query, RawEvent, Record, RemoteStore, Result, ServerSide,
};

pub const ACTION_IDENTIFIER: &str = "com.ftrack.create-from-copy.action";
pub const ACTION_LABEL: &str = "Create Project from Copy";
pub const DISCOVER_TOPIC: &str = "ftrack.action.discover";
pub const LAUNCH_TOPIC: &str = "ftrack.action.launch";

const ICON: &str = "https://cdn.jsdelivr.net/npm/feather-icons/dist/icons/copy.svg";

/// Children of these types are never descended into
const LEAF_TYPES: &[&str] = &["Task", "Milestone"];

/// Submitted form values
#[derive(Debug, Clone, PartialEq)]
pub struct CopyRequest {
    pub source_project_id: String,
    pub new_project_name: String,
    pub new_start_date: NaiveDate,
    pub user_id: Option<String>,
}

impl CopyRequest {
    /// Validate launch values; `Err` carries the message shown to the user
    pub fn from_values(values: &Value) -> std::result::Result<Self, String> {
        let text = |key| form_text(values, key);

        let new_project_name = text("new_project_name").ok_or("Please enter a project name.")?;
        let source_project_id = text("source_project_id").ok_or("Please select a source project.")?;
        let raw_date = text("new_start_date").ok_or("Please enter a start date.")?;
        let new_start_date = NaiveDate::parse_from_str(raw_date, "%Y-%m-%d")
            .map_err(|_| format!("Invalid start date {:?}, expected YYYY-MM-DD.", raw_date))?;

        Ok(Self {
            source_project_id: source_project_id.to_string(),
            new_project_name: new_project_name.to_string(),
            new_start_date,
            user_id: text("user_id").map(str::to_string),
        })
    }

    /// Short name derived from the full name
    pub fn short_name(&self) -> String {
        self.new_project_name.to_lowercase().replace(' ', "_")
    }
}

fn form_text<'a>(values: &'a Value, key: &str) -> Option<&'a str> {
    values
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Reply to a discover event
pub fn discover_reply() -> Value {
    json!({
        "items": [{
            "label": ACTION_LABEL,
            "actionIdentifier": ACTION_IDENTIFIER,
            "icon": ICON,
        }]
    })
}

fn failure(message: impl Into<String>) -> Value {
    json!({"success": false, "message": message.into()})
}

/// Form asking for the source project, the new name and the start date
pub fn build_form(projects: &[Record], user_id: Option<&str>, today: NaiveDate) -> Value {
    if projects.is_empty() {
        return failure("No projects found to copy from.");
    }

    let mut options: Vec<(String, String)> = projects
        .iter()
        .map(|p| (p.str("full_name").unwrap_or_default().to_string(), p.id.clone()))
        .collect();
    options.sort();
    let data: Vec<Value> = options
        .iter()
        .map(|(label, id)| json!({"label": label, "value": id}))
        .collect();

    json!({
        "type": "form",
        "title": ACTION_LABEL,
        "submit_button_label": "Create",
        "items": [
            {"type": "label", "value": "## Create Project from a Copy"},
            {"type": "label", "value": "Select a source project and enter details for the new copy."},
            {"type": "hidden", "name": "user_id", "value": user_id},
            {
                "label": "Select Source Project",
                "type": "enumerator",
                "name": "source_project_id",
                "data": data,
                "value": options[0].1,
            },
            {"label": "New Project Name", "type": "text", "name": "new_project_name", "value": ""},
            {"label": "Start Date", "type": "date", "name": "new_start_date", "value": today.format("%Y-%m-%d").to_string()},
        ]
    })
}

/// Clones projects on one store
pub struct ProjectCopier {
    store: Arc<dyn RemoteStore>,
}

impl ProjectCopier {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    /// Answer one discover or launch event; `None` means no reply is due
    pub async fn respond(&self, raw: &RawEvent) -> Option<Value> {
        match raw.topic.as_str() {
            DISCOVER_TOPIC => Some(discover_reply()),
            LAUNCH_TOPIC => {
                let identifier = raw.data.get("actionIdentifier").and_then(Value::as_str);
                if identifier != Some(ACTION_IDENTIFIER) {
                    return None;
                }
                Some(self.launch(raw).await)
            }
            _ => None,
        }
    }

    async fn launch(&self, raw: &RawEvent) -> Value {
        let Some(values) = raw.data.get("values") else {
            let user_id = raw.source.pointer("/user/id").and_then(Value::as_str);
            return match self.store.query(&Query::new("Project").select(["id", "full_name"])).await {
                Ok(projects) => {
                    info!(projects = projects.len(), "Building copy form");
                    build_form(&projects, user_id, chrono::Local::now().date_naive())
                }
                Err(e) => {
                    error!(error = %e, "Could not list projects");
                    failure(format!("Could not list projects: {}", e))
                }
            };
        };

        let request = match CopyRequest::from_values(values) {
            Ok(request) => request,
            Err(message) => {
                warn!(%message, "Rejected copy form");
                return failure(message);
            }
        };

        match self.run_job(&request).await {
            Ok(new_project_id) => json!({
                "success": true,
                "message": format!("Project '{}' copied.", request.new_project_name),
                "project_id": new_project_id,
            }),
            Err(e) => failure(format!("Could not copy project: {}", e)),
        }
    }

    async fn set_job(&self, job_id: &str, status: Option<&str>, description: &str) -> Result<()> {
        let mut fields = Fields::new();
        if let Some(status) = status {
            fields.insert("status".into(), json!(status));
        }
        fields.insert("data".into(), json!(json!({"description": description}).to_string()));
        self.store.update("Job", job_id, fields).await?;
        self.store.commit().await
    }

    /// Clone under a Job that ends `done` or `failed`
    pub async fn run_job(&self, request: &CopyRequest) -> Result<String> {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!("running"));
        fields.insert(
            "data".into(),
            json!(json!({"description": format!("Starting copy of project '{}'.", request.new_project_name)}).to_string()),
        );
        if let Some(user_id) = &request.user_id {
            fields.insert("user_id".into(), json!(user_id));
        }
        let job = self.store.create("Job", fields).await?;
        self.store.commit().await?;
        info!(job = %job.id, "Created job");

        match self.clone_project(request, &job.id).await {
            Ok(new_project_id) => {
                let description = format!("Successfully copied project '{}'.", request.new_project_name);
                self.set_job(&job.id, Some("done"), &description).await?;
                info!(job = %job.id, project = %new_project_id, "Job done");
                Ok(new_project_id)
            }
            Err(e) => {
                error!(job = %job.id, error = %e, "Job failed");
                self.store.rollback().await;
                let description = format!("ERROR: Could not copy project. Reason: {}", e);
                if let Err(update) = self.set_job(&job.id, Some("failed"), &description).await {
                    error!(job = %job.id, error = %update, "Could not mark job failed");
                }
                Err(e)
            }
        }
    }

    async fn clone_project(&self, request: &CopyRequest, job_id: &str) -> Result<String> {
        let source = self
            .store
            .get(
                "Project",
                &request.source_project_id,
                &["name", "full_name", "project_schema", "start_date", "end_date"],
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("Project {}", request.source_project_id)))?;

        let new_start = request.new_start_date.and_time(chrono::NaiveTime::MIN);
        let new_end = end_date_for(&source, new_start);
        if new_end.is_none() {
            warn!("Source project has no start/end dates, new end date left unset");
        }

        let duplicate = self
            .store
            .query_first(&Query::new("Project").filter(Filter::eq("full_name", request.new_project_name.as_str())))
            .await?;
        if duplicate.is_some() {
            return Err(Error::Create(format!(
                "A project named '{}' already exists.",
                request.new_project_name
            )));
        }

        self.set_job(job_id, None, &format!("Creating project '{}'...", request.new_project_name))
            .await?;

        let mut fields = Fields::new();
        fields.insert("name".into(), json!(request.short_name()));
        fields.insert("full_name".into(), json!(request.new_project_name));
        if let Some(schema) = source.get("project_schema") {
            fields.insert("project_schema".into(), schema.clone());
        }
        fields.insert("start_date".into(), datetime_value(new_start));
        if let Some(end) = new_end {
            fields.insert("end_date".into(), datetime_value(end));
        }
        let project = self.store.create("Project", fields).await?;
        self.copy_custom_attributes(&source.id, &project.id).await?;
        self.store.commit().await?;
        info!(
            project = %request.new_project_name,
            short_name = %request.short_name(),
            id = %project.id,
            "Created project, copying children"
        );

        let copied = self.clone_tree(&source, &project).await?;
        info!(copied, "Project tree copied");
        Ok(project.id)
    }

    /// Depth-first copy of every child below `source`, ordered by position
    async fn clone_tree(&self, source: &Record, target: &Record) -> Result<usize> {
        let mut copied = 0;
        let mut stack = vec![(source.id.clone(), target.reference())];

        while let Some((source_parent_id, target_parent)) = stack.pop() {
            let mut children = self
                .store
                .query(
                    &Query::new("TypedContext")
                        .select(["name", "position", "type"])
                        .filter(Filter::eq("parent.id", source_parent_id.as_str())),
                )
                .await?;
            children.sort_by(|a, b| {
                let pa = a.i64("position").unwrap_or(0);
                let pb = b.i64("position").unwrap_or(0);
                pa.cmp(&pb).then_with(|| a.str("name").cmp(&b.str("name")))
            });
            debug!(parent = %source_parent_id, children = children.len(), "Copying children");

            let mut descend = Vec::new();
            for child in &children {
                let mut fields = Fields::new();
                fields.insert("name".into(), json!(child.str("name").unwrap_or_default()));
                fields.insert("parent".into(), target_parent.clone());
                if child.entity_type == "Task" {
                    // Type only: status and assignees start fresh
                    if let Some(task_type) = child.get("type") {
                        fields.insert("type".into(), task_type.clone());
                    }
                }

                let created = self.store.create(&child.entity_type, fields).await?;
                self.copy_custom_attributes(&child.id, &created.id).await?;
                self.store.commit().await?;
                copied += 1;

                if !LEAF_TYPES.contains(&child.entity_type.as_str()) {
                    descend.push((child.id.clone(), created.reference()));
                }
            }
            // Reverse so the lowest position is copied first
            stack.extend(descend.into_iter().rev());
        }
        Ok(copied)
    }

    async fn copy_custom_attributes(&self, from_id: &str, to_id: &str) -> Result<()> {
        let values = self
            .store
            .query(
                &Query::new("ContextCustomAttributeValue")
                    .select(["configuration_id", "value"])
                    .filter(Filter::eq("entity_id", from_id)),
            )
            .await?;
        for value in values {
            let mut fields = Fields::new();
            fields.insert("entity_id".into(), json!(to_id));
            fields.insert(
                "configuration_id".into(),
                value.get("configuration_id").cloned().unwrap_or(Value::Null),
            );
            fields.insert("value".into(), value.get("value").cloned().unwrap_or(Value::Null));
            self.store.create("ContextCustomAttributeValue", fields).await?;
        }
        Ok(())
    }
}

/// New end date keeping the source project's duration
fn end_date_for(source: &Record, new_start: NaiveDateTime) -> Option<NaiveDateTime> {
    let start = parse_datetime(source.get("start_date")?)?;
    let end = parse_datetime(source.get("end_date")?)?;
    Some(new_start + (end - start))
}

/// Listener serving the copy action on one server
pub struct ProjectCopyListener {
    settings: ProjectCopySettings,
    connector: Arc<dyn Connector>,
    connected: Option<(Arc<dyn EventHub>, ProjectCopier)>,
}

impl ProjectCopyListener {
    pub fn new(settings: ProjectCopySettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            connector,
            connected: None,
        }
    }
}

#[async_trait]
impl Listener for ProjectCopyListener {
    fn name(&self) -> &str {
        "project_copy"
    }

    async fn connect(&mut self) -> Result<()> {
        let side = ServerSide::new(&self.settings.server_prefix, "origin");
        let hub = self.connector.open_hub(&side).await?;
        let store = self.connector.open_store(&side).await?;
        info!(server = %store.server_name(), action = ACTION_IDENTIFIER, "Project copy action registered");
        self.connected = Some((hub, ProjectCopier::new(store)));
        Ok(())
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let (hub, copier) = self
            .connected
            .take()
            .ok_or_else(|| Error::Hub("project copy listener is not connected".to_string()))?;
        let topics = [DISCOVER_TOPIC.to_string(), LAUNCH_TOPIC.to_string()];
        let mut requests = hub.subscribe(&topics, 16).await?;

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = requests.next() => match next {
                    Some(raw) => {
                        if let Some(reply) = copier.respond(&raw).await {
                            if let Err(e) = hub.reply(&raw, reply).await {
                                error!(topic = %raw.topic, error = %e, "Could not send action reply");
                            }
                        }
                    }
                    None => break Err(Error::Hub(format!("event hub of {} closed", hub.server_name()))),
                },
            }
        };
        hub.close();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        let ok = CopyRequest::from_values(&json!({
            "source_project_id": "p-1",
            "new_project_name": "  Big Show 2 ",
            "new_start_date": "2026-03-01",
            "user_id": "u-1",
        }))
        .unwrap();
        assert_eq!(ok.new_project_name, "Big Show 2");
        assert_eq!(ok.short_name(), "big_show_2");
        assert_eq!(ok.user_id.as_deref(), Some("u-1"));

        let unnamed = CopyRequest::from_values(&json!({
            "source_project_id": "p-1",
            "new_project_name": "",
            "new_start_date": "2026-03-01",
        }));
        assert_eq!(unnamed.unwrap_err(), "Please enter a project name.");

        let bad_date = CopyRequest::from_values(&json!({
            "source_project_id": "p-1",
            "new_project_name": "X",
            "new_start_date": "03/01/2026",
        }));
        assert!(bad_date.unwrap_err().contains("Invalid start date"));
    }

    #[test]
    fn test_form_lists_projects_sorted() {
        let projects = vec![
            Record::from_json(json!({"__entity_type__": "Project", "id": "b", "full_name": "Zeta"})).unwrap(),
            Record::from_json(json!({"__entity_type__": "Project", "id": "a", "full_name": "Alpha"})).unwrap(),
        ];
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        let form = build_form(&projects, Some("u-1"), today);

        assert_eq!(form["type"], "form");
        let enumerator = &form["items"][3];
        assert_eq!(enumerator["data"][0]["label"], "Alpha");
        assert_eq!(enumerator["value"], "a");
        assert_eq!(form["items"][2]["value"], "u-1");
        assert_eq!(form["items"][5]["value"], "2026-10-18");
    }

    #[test]
    fn test_empty_form_is_failure() {
        let form = build_form(&[], None, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(form["success"], false);
    }

    #[test]
    fn test_end_date_keeps_duration() {
        let source = Record::from_json(json!({
            "__entity_type__": "Project",
            "id": "p",
            "start_date": {"__type__": "datetime", "value": "2026-01-01T00:00:00"},
            "end_date": {"__type__": "datetime", "value": "2026-03-02T00:00:00"},
        }))
        .unwrap();
        let start = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap().and_time(chrono::NaiveTime::MIN);

        let end = end_date_for(&source, start).unwrap();
        assert_eq!(end.date(), NaiveDate::from_ymd_opt(2026, 7, 31).unwrap());
    }
}
