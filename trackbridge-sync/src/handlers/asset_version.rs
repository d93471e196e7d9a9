use super::{commit, enter, find_project, find_user, settle, visible, AtStage, StageError, SyncHandler, SyncStage};
use crate::outcome::SyncOutcome;
use async_trait::async_trait;
use serde_json::json;
use trackbridge_common::store::Fields;
use trackbridge_common::{
    fetch_query_with_retry, fetch_with_retry, Action, EntityKind, Event, FetchError, Filter, Query, RemoteStore,
    RetryPolicy,
};

const VERSION_PROJECTIONS: &[&str] = &[
    "version",
    "comment",
    "asset.name",
    "asset.project.full_name",
    "status.name",
    "user.username",
];

/// Mirrors new AssetVersions into the matching Asset on the target
///
/// Versions are identified by their integer `version` number only.
/// Idempotency key on the target: `(version, asset id)`. The target Asset is
/// polled like a source entity, since it is often mirrored moments earlier.
pub struct AssetVersionSync {
    retry: RetryPolicy,
}

impl AssetVersionSync {
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
        let fetched = fetch_with_retry(source, "AssetVersion", &event.entity_id, VERSION_PROJECTIONS, &self.retry).await;
        let Some(version) = visible(fetched)? else {
            return Ok(SyncOutcome::SkippedNotVisible);
        };

        let Some(number) = version.i64("version") else {
            return Ok(SyncOutcome::SkippedIneligible("asset version has no version number".into()));
        };
        let (Some(asset_name), Some(project_name)) =
            (version.path_str("asset.name"), version.path_str("asset.project.full_name"))
        else {
            return Ok(SyncOutcome::SkippedParentNotFound("source version has no asset".into()));
        };
        tracing::debug!(asset = %asset_name, project = %project_name, version = number, "Resolved source version");

        enter(SyncStage::ResolvingTargetParent);
        let Some(project) = find_project(target, project_name)
            .await
            .at(SyncStage::ResolvingTargetParent)?
        else {
            return Ok(SyncOutcome::SkippedParentNotFound(format!("project {}", project_name)));
        };
        let asset_query = Query::new("Asset")
            .filter(Filter::eq("name", asset_name).and(Filter::eq("project.id", project.id.as_str())));
        let asset = match fetch_query_with_retry(target, &asset_query, &self.retry).await {
            Ok(asset) => asset,
            Err(FetchError::NotYetVisible { .. }) => {
                return Ok(SyncOutcome::SkippedParentNotFound(format!(
                    "asset {} in {}",
                    asset_name, project_name
                )));
            }
            Err(FetchError::Store { source, .. }) => {
                return Err(StageError {
                    stage: SyncStage::ResolvingTargetParent,
                    source,
                });
            }
        };

        enter(SyncStage::CheckingIdempotency);
        let existing = target
            .query_first(
                &Query::new("AssetVersion")
                    .filter(Filter::eq("version", number).and(Filter::eq("asset.id", asset.id.as_str()))),
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
        fields.insert("version".into(), json!(number));
        fields.insert("asset".into(), asset.reference());
        if let Some(comment) = version.str("comment") {
            fields.insert("comment".into(), json!(comment));
        }

        if let Some(status_name) = version.path_str("status.name") {
            let status = target
                .query_first(&Query::new("Status").filter(Filter::eq("name", status_name)))
                .await
                .at(SyncStage::Creating)?;
            match status {
                Some(status) => {
                    fields.insert("status".into(), status.reference());
                }
                None => tracing::warn!(status = %status_name, "Status not found on target, omitting"),
            }
        }

        if let Some(username) = version.path_str("user.username") {
            match find_user(target, username).await.at(SyncStage::Creating)? {
                Some(user) => {
                    fields.insert("user".into(), user.reference());
                }
                None => tracing::warn!(%username, "User not found on target, omitting"),
            }
        }

        let created = target.create("AssetVersion", fields).await.at(SyncStage::Creating)?;
        commit(target).await?;

        Ok(SyncOutcome::Created { id: created.id })
    }
}

#[async_trait]
impl SyncHandler for AssetVersionSync {
    fn name(&self) -> &'static str {
        "asset_version"
    }

    fn should_handle(&self, event: &Event) -> bool {
        event.entity_kind == EntityKind::AssetVersion && event.action == Action::Add
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

    fn handler() -> AssetVersionSync {
        AssetVersionSync::new(RetryPolicy::fixed(2, Duration::from_millis(1)))
    }

    fn seed(store: &MemoryStore, with_asset: bool) -> Option<String> {
        let project = store.insert("Project", json!({"name": "demo", "full_name": "DEMO"}));
        store.insert("Status", json!({"name": "Pending Review"}));
        store.insert("User", json!({"username": "jane"}));
        with_asset.then(|| {
            store
                .insert(
                    "Asset",
                    json!({"name": "heroProp", "project": entity_ref("Project", &project.id)}),
                )
                .id
        })
    }

    fn origin_version(origin: &MemoryStore, asset_id: &str, number: i64) -> String {
        let status = origin.all("Status").remove(0);
        let user = origin.all("User").remove(0);
        origin
            .insert(
                "AssetVersion",
                json!({
                    "version": number,
                    "comment": "first pass",
                    "asset": entity_ref("Asset", asset_id),
                    "status": status.reference(),
                    "user": user.reference(),
                }),
            )
            .id
    }

    fn add(id: &str) -> Event {
        Event::new("ftrack.update", EntityKind::AssetVersion, Action::Add, id)
    }

    #[tokio::test]
    async fn test_version_is_mirrored_with_status_and_user() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");
        let asset_id = seed(&origin, true).unwrap();
        let target_asset = seed(&mirror, true).unwrap();
        let id = origin_version(&origin, &asset_id, 7);

        let outcome = handler().sync(&add(&id), &origin, &mirror).await;
        let SyncOutcome::Created { id: created } = outcome else {
            panic!("expected created, got {:?}", outcome);
        };

        let mirrored = mirror.find("AssetVersion", &created).unwrap();
        assert_eq!(mirrored.i64("version"), Some(7));
        assert_eq!(mirrored.str("comment"), Some("first pass"));
        assert_eq!(mirrored.path_str("asset.id"), Some(target_asset.as_str()));
        assert!(mirrored.get("status").is_some());
        assert!(mirrored.get("user").is_some());
    }

    #[tokio::test]
    async fn test_same_version_number_is_not_duplicated() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");
        let asset_id = seed(&origin, true).unwrap();
        seed(&mirror, true).unwrap();
        let id = origin_version(&origin, &asset_id, 3);

        assert!(handler().sync(&add(&id), &origin, &mirror).await.is_created());
        let again = handler().sync(&add(&id), &origin, &mirror).await;

        assert!(matches!(again, SyncOutcome::SkippedAlreadyExists { .. }));
        assert_eq!(mirror.count("AssetVersion"), 1);
    }

    #[tokio::test]
    async fn test_missing_target_asset() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");
        let asset_id = seed(&origin, true).unwrap();
        seed(&mirror, false);
        let id = origin_version(&origin, &asset_id, 7);

        let outcome = handler().sync(&add(&id), &origin, &mirror).await;

        assert_eq!(
            outcome,
            SyncOutcome::SkippedParentNotFound("asset heroProp in DEMO".into())
        );
        assert_eq!(mirror.count("AssetVersion"), 0);
        assert_eq!(mirror.rollback_count(), 0);
    }

    #[tokio::test]
    async fn test_target_asset_visible_on_second_read() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");
        let asset_id = seed(&origin, true).unwrap();
        let target_asset = seed(&mirror, true).unwrap();
        mirror.hide_for_reads(&target_asset, 1);
        let id = origin_version(&origin, &asset_id, 2);

        let outcome = handler().sync(&add(&id), &origin, &mirror).await;

        assert!(outcome.is_created());
        let mirrored = mirror.all("AssetVersion");
        assert_eq!(mirrored[0].path_str("asset.id"), Some(target_asset.as_str()));
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_once() {
        let origin = MemoryStore::new("origin");
        let mirror = MemoryStore::new("mirror");
        let asset_id = seed(&origin, true).unwrap();
        seed(&mirror, true).unwrap();
        let id = origin_version(&origin, &asset_id, 1);
        mirror.fail_next_commit("connection reset");

        let outcome = handler().sync(&add(&id), &origin, &mirror).await;

        assert!(outcome.is_failed());
        assert_eq!(mirror.rollback_count(), 1);
        assert_eq!(mirror.count("AssetVersion"), 0);
    }
}
