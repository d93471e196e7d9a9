//! Shot task templating
//!
//! When a Shot is added, create one Task per template name under it, typed
//! by the task Type of the same name and started with the default Status and
//! Priority. Existing tasks of the same name are left alone, so a replayed
//! event creates nothing new.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trackbridge_common::config::ShotTaskSettings;
use trackbridge_common::event::normalize;
use trackbridge_common::store::Fields;
use trackbridge_common::{
    fetch_with_retry, Action, Connector, EntityKind, Error, EventHub, FetchError, Filter, Listener, Query, RawEvent,
    Record, RemoteStore, Result, RetryPolicy, ServerSide,
};

/// What happened to one Shot's template
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TemplateReport {
    pub created: Vec<String>,
    pub already_present: Vec<String>,
    pub missing_type: Vec<String>,
    pub failed: Vec<String>,
}

/// Applies the task template to Shots of one store
pub struct ShotTemplater {
    store: Arc<dyn RemoteStore>,
    settings: ShotTaskSettings,
    retry: RetryPolicy,
}

impl ShotTemplater {
    pub fn new(store: Arc<dyn RemoteStore>, settings: ShotTaskSettings, retry: RetryPolicy) -> Self {
        Self { store, settings, retry }
    }

    async fn by_name(&self, entity_type: &str, name: &str) -> Result<Option<Record>> {
        self.store
            .query_first(&Query::new(entity_type).filter(Filter::eq("name", name)))
            .await
    }

    /// Create the template tasks under one Shot
    ///
    /// Returns `Ok(None)` when the Shot never became readable.
    pub async fn apply(&self, shot_id: &str) -> Result<Option<TemplateReport>> {
        let shot = match fetch_with_retry(self.store.as_ref(), "Shot", shot_id, &["name", "project.full_name"], &self.retry).await {
            Ok(shot) => shot,
            Err(FetchError::NotYetVisible { attempts, .. }) => {
                error!(shot_id, attempts, "Shot never became visible, skipping template");
                return Ok(None);
            }
            Err(FetchError::Store { source, .. }) => return Err(source),
        };
        let shot_name = shot.str("name").unwrap_or_default().to_string();
        info!(
            shot = %shot_name,
            project = shot.path_str("project.full_name").unwrap_or("?"),
            "Applying task template"
        );

        let status = self.by_name("Status", &self.settings.default_status).await?;
        if status.is_none() {
            warn!(status = %self.settings.default_status, "Status not found, tasks get the schema default");
        }
        let priority = self.by_name("Priority", &self.settings.default_priority).await?;
        if priority.is_none() {
            warn!(priority = %self.settings.default_priority, "Priority not found, tasks get the schema default");
        }

        let mut report = TemplateReport::default();
        for task_name in &self.settings.task_names {
            let Some(task_type) = self.by_name("Type", task_name).await? else {
                warn!(task = %task_name, "No task Type with this name, skipping");
                report.missing_type.push(task_name.clone());
                continue;
            };

            let existing = self
                .store
                .query_first(
                    &Query::new("Task")
                        .filter(Filter::eq("name", task_name.as_str()).and(Filter::eq("parent.id", shot.id.as_str()))),
                )
                .await?;
            if existing.is_some() {
                debug!(task = %task_name, shot = %shot_name, "Task already present");
                report.already_present.push(task_name.clone());
                continue;
            }

            let mut fields = Fields::new();
            fields.insert("name".into(), json!(task_name));
            fields.insert("parent".into(), shot.reference());
            fields.insert("type".into(), task_type.reference());
            if let Some(status) = &status {
                fields.insert("status".into(), status.reference());
            }
            if let Some(priority) = &priority {
                fields.insert("priority".into(), priority.reference());
            }

            let created = match self.store.create("Task", fields).await {
                Ok(created) => created,
                Err(e) => {
                    error!(task = %task_name, error = %e, "Task create rejected");
                    self.store.rollback().await;
                    report.failed.push(task_name.clone());
                    continue;
                }
            };
            match self.store.commit().await {
                Ok(()) => {
                    info!(task = %task_name, shot = %shot_name, id = %created.id, "Created task");
                    report.created.push(task_name.clone());
                }
                Err(e) => {
                    error!(task = %task_name, error = %e, "Task commit failed");
                    self.store.rollback().await;
                    report.failed.push(task_name.clone());
                }
            }
        }
        Ok(Some(report))
    }

    /// Apply the template for every Shot added in a hub event
    pub async fn handle(&self, raw: &RawEvent) {
        for event in normalize(raw) {
            if event.entity_kind != EntityKind::Shot || event.action != Action::Add {
                continue;
            }
            if let Err(e) = self.apply(&event.entity_id).await {
                error!(shot_id = %event.entity_id, error = %e, "Task template failed");
            }
        }
    }
}

/// Listener running [`ShotTemplater`] against one server's update events
pub struct ShotTaskListener {
    settings: ShotTaskSettings,
    retry: RetryPolicy,
    connector: Arc<dyn Connector>,
    connected: Option<(Arc<dyn EventHub>, ShotTemplater)>,
}

impl ShotTaskListener {
    pub fn new(settings: ShotTaskSettings, retry: RetryPolicy, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            retry,
            connector,
            connected: None,
        }
    }
}

#[async_trait]
impl Listener for ShotTaskListener {
    fn name(&self) -> &str {
        "shot_tasks"
    }

    async fn connect(&mut self) -> Result<()> {
        let side = ServerSide::new(&self.settings.server_prefix, "origin");
        let hub = self.connector.open_hub(&side).await?;
        let store = self.connector.open_store(&side).await?;
        info!(server = %store.server_name(), "Shot task listener connected");

        let templater = ShotTemplater::new(store, self.settings.clone(), self.retry.clone());
        self.connected = Some((hub, templater));
        Ok(())
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let (hub, templater) = self
            .connected
            .take()
            .ok_or_else(|| Error::Hub("shot task listener is not connected".to_string()))?;
        let mut updates = hub.subscribe(&["ftrack.update".to_string()], 64).await?;
        info!("Waiting for new Shots");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                next = updates.next() => match next {
                    Some(raw) => templater.handle(&raw).await,
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
    use std::time::Duration;
    use trackbridge_common::memory::MemoryStore;
    use trackbridge_common::store::entity_ref;

    fn store_with_shot() -> (Arc<MemoryStore>, String) {
        let store = Arc::new(MemoryStore::new("origin"));
        let project = store.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));
        let shot = store.insert("Shot", json!({"name": "sh010", "parent": entity_ref("Project", &project.id)}));
        store.insert("Status", json!({"name": "Not Started"}));
        store.insert("Priority", json!({"name": "None"}));
        for name in ["Animation", "Lighting", "Compositing"] {
            store.insert("Type", json!({"name": name}));
        }
        (store, shot.id)
    }

    fn templater(store: Arc<MemoryStore>) -> ShotTemplater {
        ShotTemplater::new(
            store,
            ShotTaskSettings::default(),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_template_creates_typed_tasks() {
        let (store, shot_id) = store_with_shot();

        let report = templater(store.clone()).apply(&shot_id).await.unwrap().unwrap();

        assert_eq!(report.created, vec!["Animation", "Lighting", "Compositing"]);
        let tasks = store.all("Task");
        assert_eq!(tasks.len(), 3);
        for task in &tasks {
            assert_eq!(task.path_str("parent.id"), Some(shot_id.as_str()));
            assert!(task.get("type").is_some());
            assert!(task.get("status").is_some());
            assert!(task.get("priority").is_some());
        }
    }

    #[tokio::test]
    async fn test_template_is_idempotent() {
        let (store, shot_id) = store_with_shot();
        let t = templater(store.clone());

        t.apply(&shot_id).await.unwrap();
        let second = t.apply(&shot_id).await.unwrap().unwrap();

        assert!(second.created.is_empty());
        assert_eq!(second.already_present.len(), 3);
        assert_eq!(store.count("Task"), 3);
    }

    #[tokio::test]
    async fn test_missing_type_skips_only_that_task() {
        let store = Arc::new(MemoryStore::new("origin"));
        let shot = store.insert("Shot", json!({"name": "sh020"}));
        store.insert("Type", json!({"name": "Lighting"}));

        let report = templater(store.clone()).apply(&shot.id).await.unwrap().unwrap();

        assert_eq!(report.created, vec!["Lighting"]);
        assert_eq!(report.missing_type, vec!["Animation", "Compositing"]);
        assert!(store.all("Task")[0].get("status").is_none());
    }

    #[tokio::test]
    async fn test_commit_failure_continues_with_next_task() {
        let (store, shot_id) = store_with_shot();
        store.fail_next_commit("locked");

        let report = templater(store.clone()).apply(&shot_id).await.unwrap().unwrap();

        assert_eq!(report.failed, vec!["Animation"]);
        assert_eq!(report.created, vec!["Lighting", "Compositing"]);
        assert_eq!(store.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_invisible_shot_is_skipped() {
        let store = Arc::new(MemoryStore::new("origin"));
        assert!(templater(store).apply("ghost").await.unwrap().is_none());
    }
}
