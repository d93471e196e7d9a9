use super::{commit, enter, find_project, settle, visible, AtStage, StageError, SyncHandler, SyncStage};
use crate::outcome::SyncOutcome;
use async_trait::async_trait;
use serde_json::json;
use trackbridge_common::store::Fields;
use trackbridge_common::{fetch_with_retry, Action, EntityKind, Event, Filter, Query, RemoteStore, RetryPolicy};

/// Mirrors newly added Tasks whose name carries the pipeline marker
///
/// Idempotency key on the target: `(name, parent project id)`.
pub struct TaskSync {
    marker: String,
    retry: RetryPolicy,
}

impl TaskSync {
    pub fn new(marker: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            marker: marker.into().to_lowercase(),
            retry,
        }
    }

    fn is_marked(&self, name: &str) -> bool {
        name.to_lowercase().contains(&self.marker)
    }

    async fn attempt(
        &self,
        event: &Event,
        source: &dyn RemoteStore,
        target: &dyn RemoteStore,
    ) -> Result<SyncOutcome, StageError> {
        enter(SyncStage::ResolvingSource);
        let fetched = fetch_with_retry(
            source,
            "Task",
            &event.entity_id,
            &["name", "project.full_name"],
            &self.retry,
        )
        .await;
        let Some(task) = visible(fetched)? else {
            return Ok(SyncOutcome::SkippedNotVisible);
        };

        let name = task.str("name").unwrap_or_default().to_string();
        if !self.is_marked(&name) {
            return Ok(SyncOutcome::SkippedIneligible(format!(
                "task {:?} lacks marker {:?}",
                name, self.marker
            )));
        }
        let Some(project_name) = task.path_str("project.full_name") else {
            return Ok(SyncOutcome::SkippedParentNotFound("source task has no project".into()));
        };
        tracing::debug!(task = %name, project = %project_name, "Resolved source task");

        enter(SyncStage::ResolvingTargetParent);
        let Some(project) = find_project(target, project_name)
            .await
            .at(SyncStage::ResolvingTargetParent)?
        else {
            return Ok(SyncOutcome::SkippedParentNotFound(format!("project {}", project_name)));
        };

        enter(SyncStage::CheckingIdempotency);
        let existing = target
            .query_first(
                &Query::new("Task")
                    .filter(Filter::eq("name", name.as_str()).and(Filter::eq("parent.id", project.id.as_str()))),
            )
            .await
            .at(SyncStage::CheckingIdempotency)?;
        if let Some(existing) = existing {
            return Ok(SyncOutcome::SkippedAlreadyExists {
                existing_id: existing.id,
            });
        }

        enter(SyncStage::Creating);
        let mut fields = Fields::new();
        fields.insert("name".into(), json!(name));
        fields.insert("parent".into(), project.reference());
        let created = target.create("Task", fields).await.at(SyncStage::Creating)?;
        commit(target).await?;

        Ok(SyncOutcome::Created { id: created.id })
    }
}

#[async_trait]
impl SyncHandler for TaskSync {
    fn name(&self) -> &'static str {
        "task"
    }

    fn should_handle(&self, event: &Event) -> bool {
        event.entity_kind == EntityKind::Task && event.action == Action::Add
    }

    async fn sync(&self, event: &Event, source: &dyn RemoteStore, target: &dyn RemoteStore) -> SyncOutcome {
        let result = self.attempt(event, source, target).await;
        settle(target, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trackbridge_common::memory::MemoryStore;
    use trackbridge_common::store::entity_ref;

    fn handler() -> TaskSync {
        TaskSync::new("asset-request", RetryPolicy::fixed(3, Duration::from_millis(1)))
    }

    fn origin_with_task(name: &str) -> (MemoryStore, String) {
        let origin = MemoryStore::new("origin");
        let project = origin.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));
        let task = origin.insert("Task", json!({"name": name, "parent": entity_ref("Project", &project.id)}));
        (origin, task.id)
    }

    #[test]
    fn test_marker_is_case_insensitive() {
        let h = TaskSync::new("Asset-Request", RetryPolicy::default());
        assert!(h.is_marked("charA_ASSET-REQUEST_v01"));
        assert!(!h.is_marked("charA_layout"));
    }

    #[test]
    fn test_only_handles_task_adds() {
        let h = handler();
        assert!(h.should_handle(&Event::new("ftrack.update", EntityKind::Task, Action::Add, "t")));
        assert!(!h.should_handle(&Event::new("ftrack.update", EntityKind::Task, Action::Update, "t")));
        assert!(!h.should_handle(&Event::new("ftrack.update", EntityKind::Note, Action::Add, "t")));
    }

    #[tokio::test]
    async fn test_unmarked_task_is_ineligible() {
        let (origin, task_id) = origin_with_task("charA_layout");
        let mirror = MemoryStore::new("mirror");
        mirror.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));

        let event = Event::new("ftrack.update", EntityKind::Task, Action::Add, task_id);
        let outcome = handler().sync(&event, &origin, &mirror).await;

        assert!(matches!(outcome, SyncOutcome::SkippedIneligible(_)));
        assert_eq!(mirror.count("Task"), 0);
    }

    #[tokio::test]
    async fn test_missing_target_project() {
        let (origin, task_id) = origin_with_task("charA_asset-request_v01");
        let mirror = MemoryStore::new("mirror");

        let event = Event::new("ftrack.update", EntityKind::Task, Action::Add, task_id);
        let outcome = handler().sync(&event, &origin, &mirror).await;

        assert_eq!(outcome, SyncOutcome::SkippedParentNotFound("project DEMO".into()));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_visible() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");

        let event = Event::new("ftrack.update", EntityKind::Task, Action::Add, "missing");
        let outcome = handler().sync(&event, &origin, &mirror).await;

        assert_eq!(outcome, SyncOutcome::SkippedNotVisible);
        assert_eq!(origin.query_count(), 3);
    }

    #[tokio::test]
    async fn test_create_failure_rolls_back() {
        let (origin, task_id) = origin_with_task("charA_asset-request_v01");
        let mirror = MemoryStore::new("mirror");
        mirror.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));
        mirror.fail_next_create("permission denied");

        let event = Event::new("ftrack.update", EntityKind::Task, Action::Add, task_id);
        let outcome = handler().sync(&event, &origin, &mirror).await;

        assert!(outcome.is_failed());
        assert_eq!(mirror.rollback_count(), 1);
        assert_eq!(mirror.count("Task"), 0);
    }
}
