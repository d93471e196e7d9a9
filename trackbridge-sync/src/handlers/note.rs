use super::{commit, enter, find_project, find_user, settle, visible, AtStage, StageError, SyncHandler, SyncStage};
use crate::outcome::SyncOutcome;
use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use trackbridge_common::store::{entity_ref, Fields};
use trackbridge_common::{fetch_with_retry, Action, EntityKind, Event, Filter, Query, RemoteStore, RetryPolicy};

/// Metadata key marking a note as a mirrored copy
pub const SYNCED_FROM_KEY: &str = "synced_from";

const NOTE_PROJECTIONS: &[&str] = &[
    "content",
    "subject",
    "parent",
    "parent.name",
    "parent.project.full_name",
    "author.username",
];

/// Idempotency key of a note body
pub fn content_key(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Mirrors notes attached to Tasks, in either direction
///
/// A copy carries a `synced_from` Metadata record so it is never mirrored
/// back. Idempotency key on the target: `(sha256(content), task id)`.
pub struct NoteSync {
    retry: RetryPolicy,
}

impl NoteSync {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    async fn attempt(
        &self,
        event: &Event,
        source: &dyn RemoteStore,
        target: &dyn RemoteStore,
    ) -> Result<SyncOutcome, StageError> {
        enter(SyncStage::ResolvingSource);
        let fetched = fetch_with_retry(source, "Note", &event.entity_id, NOTE_PROJECTIONS, &self.retry).await;
        let on_target = target
            .get("Note", &event.entity_id, &[])
            .await
            .at(SyncStage::ResolvingSource)?;

        let note = match (visible(fetched)?, on_target) {
            (Some(_), Some(existing)) => {
                return Ok(SyncOutcome::SkippedAlreadyExists {
                    existing_id: existing.id,
                })
            }
            (None, Some(_)) => {
                return Ok(SyncOutcome::SkippedIneligible(format!(
                    "note belongs to {}",
                    target.server_name()
                )))
            }
            (None, None) => return Ok(SyncOutcome::SkippedNotVisible),
            (Some(note), None) => note,
        };

        let tag = source
            .query_first(
                &Query::new("Metadata")
                    .select(["value"])
                    .filter(Filter::eq("parent_id", note.id.as_str()).and(Filter::eq("key", SYNCED_FROM_KEY))),
            )
            .await
            .at(SyncStage::ResolvingSource)?;
        if let Some(tag) = tag {
            return Ok(SyncOutcome::SkippedIneligible(format!(
                "mirrored copy from {}",
                tag.str("value").unwrap_or("unknown")
            )));
        }

        let parent_type = note.path_str(&format!("parent.{}", trackbridge_common::store::ENTITY_TYPE_KEY));
        if parent_type != Some("Task") {
            return Ok(SyncOutcome::SkippedIneligible(format!(
                "note parent is {}",
                parent_type.unwrap_or("missing")
            )));
        }
        let (Some(task_name), Some(project_name)) =
            (note.path_str("parent.name"), note.path_str("parent.project.full_name"))
        else {
            return Ok(SyncOutcome::SkippedParentNotFound("source task has no project".into()));
        };

        enter(SyncStage::ResolvingTargetParent);
        let Some(project) = find_project(target, project_name)
            .await
            .at(SyncStage::ResolvingTargetParent)?
        else {
            return Ok(SyncOutcome::SkippedParentNotFound(format!("project {}", project_name)));
        };
        let Some(task) = target
            .query_first(
                &Query::new("Task")
                    .filter(Filter::eq("name", task_name).and(Filter::eq("project.id", project.id.as_str()))),
            )
            .await
            .at(SyncStage::ResolvingTargetParent)?
        else {
            return Ok(SyncOutcome::SkippedParentNotFound(format!("task {} in {}", task_name, project_name)));
        };

        enter(SyncStage::CheckingIdempotency);
        let content = note.str("content").unwrap_or_default();
        let key = content_key(content);
        let siblings = target
            .query(
                &Query::new("Note")
                    .select(["content"])
                    .filter(Filter::eq("parent.id", task.id.as_str())),
            )
            .await
            .at(SyncStage::CheckingIdempotency)?;
        if let Some(existing) = siblings
            .into_iter()
            .find(|n| content_key(n.str("content").unwrap_or_default()) == key)
        {
            return Ok(SyncOutcome::SkippedAlreadyExists {
                existing_id: existing.id,
            });
        }

        enter(SyncStage::Creating);
        let mut fields = Fields::new();
        fields.insert("content".into(), json!(content));
        fields.insert("subject".into(), json!(note.str("subject").unwrap_or_default()));
        fields.insert("parent".into(), task.reference());

        let author = match note.path_str("author.username") {
            Some(username) => {
                let found = find_user(target, username).await.at(SyncStage::Creating)?;
                if found.is_none() {
                    tracing::warn!(%username, "Author not found on target, creating note without one");
                }
                found
            }
            None => None,
        };
        if let Some(author) = &author {
            fields.insert("author".into(), author.reference());
        }

        match target.has_property("Note", "recipients").await {
            Ok(true) => {
                let recipients: Vec<Value> = author.iter().map(|a| a.reference()).collect();
                fields.insert("recipients".into(), Value::Array(recipients));
            }
            Ok(false) => tracing::debug!("Target schema has no Note.recipients, omitting"),
            Err(e) => tracing::warn!(error = %e, "Note schema unavailable, omitting recipients"),
        }

        let created = target.create("Note", fields).await.at(SyncStage::Creating)?;

        let mut tag = Fields::new();
        tag.insert("parent_id".into(), json!(created.id));
        tag.insert("parent_type".into(), json!("Note"));
        tag.insert("key".into(), json!(SYNCED_FROM_KEY));
        tag.insert("value".into(), json!(source.server_name()));
        target.create("Metadata", tag).await.at(SyncStage::Creating)?;

        commit(target).await?;
        tracing::debug!(note = %entity_ref("Note", &created.id), "Mirrored note committed with tag");

        Ok(SyncOutcome::Created { id: created.id })
    }
}

#[async_trait]
impl SyncHandler for NoteSync {
    fn name(&self) -> &'static str {
        "note"
    }

    fn should_handle(&self, event: &Event) -> bool {
        event.entity_kind == EntityKind::Note && matches!(event.action, Action::Add | Action::Update)
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
    use trackbridge_common::Record;

    struct Pair {
        origin: MemoryStore,
        mirror: MemoryStore,
        origin_task: Record,
        mirror_task: Record,
    }

    fn pair() -> Pair {
        let origin = MemoryStore::new("PBV");
        let mirror = MemoryStore::new("UNDARK");
        let mut tasks = Vec::new();
        for store in [&origin, &mirror] {
            let project = store.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));
            tasks.push(store.insert(
                "Task",
                json!({"name": "charA", "parent": entity_ref("Project", &project.id)}),
            ));
            store.insert("User", json!({"username": "jane"}));
        }
        let mirror_task = tasks.pop().unwrap();
        let origin_task = tasks.pop().unwrap();
        Pair {
            origin,
            mirror,
            origin_task,
            mirror_task,
        }
    }

    fn handler() -> NoteSync {
        NoteSync::new(RetryPolicy::fixed(2, Duration::from_millis(1)))
    }

    fn add(id: &str) -> Event {
        Event::new("ftrack.update", EntityKind::Note, Action::Add, id)
    }

    #[test]
    fn test_content_key_is_sha256_hex() {
        assert_eq!(
            content_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_note_is_mirrored_with_tag_and_author() {
        let p = pair();
        let author = p.origin.all("User").remove(0);
        let note = p.origin.insert(
            "Note",
            json!({
                "content": "Please fix the rig",
                "subject": "rig",
                "parent": entity_ref("Task", &p.origin_task.id),
                "author": author.reference(),
            }),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        let SyncOutcome::Created { id } = outcome else {
            panic!("expected created, got {:?}", outcome);
        };

        let mirrored = p.mirror.find("Note", &id).unwrap();
        assert_eq!(mirrored.str("content"), Some("Please fix the rig"));
        assert_eq!(mirrored.path_str("parent.id"), Some(p.mirror_task.id.as_str()));
        assert!(mirrored.get("author").is_some());
        assert!(mirrored.get("recipients").is_none());

        let tags = p.mirror.all("Metadata");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].str("parent_id"), Some(id.as_str()));
        assert_eq!(tags[0].str("value"), Some("PBV"));
    }

    #[tokio::test]
    async fn test_unknown_author_is_omitted() {
        let p = pair();
        let stranger = p.origin.insert("User", json!({"username": "contractor"}));
        let note = p.origin.insert(
            "Note",
            json!({
                "content": "hello",
                "parent": entity_ref("Task", &p.origin_task.id),
                "author": stranger.reference(),
            }),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        assert!(outcome.is_created());
        assert!(p.mirror.all("Note")[0].get("author").is_none());
    }

    #[tokio::test]
    async fn test_recipients_written_only_when_declared() {
        let p = pair();
        p.mirror.declare_property("Note", "recipients");
        let note = p.origin.insert(
            "Note",
            json!({"content": "hi", "parent": entity_ref("Task", &p.origin_task.id)}),
        );

        handler().sync(&add(&note.id), &p.origin, &p.mirror).await;

        let mirrored = &p.mirror.all("Note")[0];
        assert_eq!(mirrored.get("recipients"), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_tagged_copy_is_never_mirrored_back() {
        let p = pair();
        let note = p.origin.insert(
            "Note",
            json!({"content": "round trip", "parent": entity_ref("Task", &p.origin_task.id)}),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        let SyncOutcome::Created { id } = outcome else {
            panic!("expected created");
        };

        // The copy's own hub event, seen from the mirror side
        let back = handler().sync(&add(&id), &p.mirror, &p.origin).await;
        assert!(matches!(back, SyncOutcome::SkippedIneligible(ref r) if r.contains("PBV")));
        assert_eq!(p.origin.count("Note"), 1);
    }

    #[tokio::test]
    async fn test_same_content_is_not_duplicated() {
        let p = pair();
        p.mirror.insert(
            "Note",
            json!({"content": "dup", "parent": entity_ref("Task", &p.mirror_task.id)}),
        );
        let note = p.origin.insert(
            "Note",
            json!({"content": "dup", "parent": entity_ref("Task", &p.origin_task.id)}),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        assert!(matches!(outcome, SyncOutcome::SkippedAlreadyExists { .. }));
        assert_eq!(p.mirror.count("Note"), 1);
    }

    #[tokio::test]
    async fn test_missing_target_task() {
        let p = pair();
        let other = p.origin.insert(
            "Task",
            json!({"name": "propB", "parent": p.origin_task.get("parent").cloned().unwrap()}),
        );
        let note = p.origin.insert(
            "Note",
            json!({"content": "x", "parent": entity_ref("Task", &other.id)}),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        assert_eq!(
            outcome,
            SyncOutcome::SkippedParentNotFound("task propB in DEMO".into())
        );
    }

    #[tokio::test]
    async fn test_note_on_shot_is_ineligible() {
        let p = pair();
        let shot = p.origin.insert("Shot", json!({"name": "sh010"}));
        let note = p.origin.insert(
            "Note",
            json!({"content": "x", "parent": entity_ref("Shot", &shot.id)}),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        assert_eq!(outcome, SyncOutcome::SkippedIneligible("note parent is Shot".into()));
    }

    #[tokio::test]
    async fn test_note_owned_by_other_side() {
        let p = pair();
        let note = p.mirror.insert(
            "Note",
            json!({"content": "x", "parent": entity_ref("Task", &p.mirror_task.id)}),
        );

        let outcome = handler().sync(&add(&note.id), &p.origin, &p.mirror).await;
        assert_eq!(outcome, SyncOutcome::SkippedIneligible("note belongs to UNDARK".into()));
    }
}
