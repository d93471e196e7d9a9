//! Entity sync handlers
//!
//! Every handler walks the same stages:
//!
//! ```text
//! ReceivedEvent -> ResolvingSource -> ResolvingTargetParent
//!               -> CheckingIdempotency -> Creating -> Committed
//! ```
//!
//! Any stage may exit early with a skip outcome. A store error at any stage
//! becomes `Failed`, and the target's pending batch is rolled back exactly
//! once before the outcome is returned.

mod asset_version;
mod note;
mod task;

pub use asset_version::AssetVersionSync;
pub use note::NoteSync;
pub use task::TaskSync;

use crate::outcome::SyncOutcome;
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use trackbridge_common::{Event, FetchError, Filter, Query, Record, RemoteStore};

/// Mirrors one entity kind from a source store to a target store
#[async_trait]
pub trait SyncHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn should_handle(&self, event: &Event) -> bool;

    async fn sync(&self, event: &Event, source: &dyn RemoteStore, target: &dyn RemoteStore) -> SyncOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    ReceivedEvent,
    ResolvingSource,
    ResolvingTargetParent,
    CheckingIdempotency,
    Creating,
    Committed,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStage::ReceivedEvent => "received event",
            SyncStage::ResolvingSource => "resolving source",
            SyncStage::ResolvingTargetParent => "resolving target parent",
            SyncStage::CheckingIdempotency => "checking idempotency",
            SyncStage::Creating => "creating",
            SyncStage::Committed => "committed",
        };
        f.write_str(s)
    }
}

/// Store failure tagged with the stage it happened in
#[derive(Debug, Error)]
#[error("{stage}: {source}")]
pub struct StageError {
    pub stage: SyncStage,
    #[source]
    pub source: trackbridge_common::Error,
}

pub(crate) trait AtStage<T> {
    fn at(self, stage: SyncStage) -> Result<T, StageError>;
}

impl<T> AtStage<T> for trackbridge_common::Result<T> {
    fn at(self, stage: SyncStage) -> Result<T, StageError> {
        self.map_err(|source| StageError { stage, source })
    }
}

pub(crate) fn enter(stage: SyncStage) {
    tracing::trace!(%stage, "Stage");
}

/// Source record after Retry-Fetch; `None` when it never became visible
pub(crate) fn visible(fetched: Result<Record, FetchError>) -> Result<Option<Record>, StageError> {
    match fetched {
        Ok(record) => Ok(Some(record)),
        Err(FetchError::NotYetVisible { .. }) => Ok(None),
        Err(FetchError::Store { source, .. }) => Err(StageError {
            stage: SyncStage::ResolvingSource,
            source,
        }),
    }
}

/// Turn a handler run into its outcome, rolling back the target on failure
pub(crate) async fn settle(target: &dyn RemoteStore, result: Result<SyncOutcome, StageError>) -> SyncOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(err) => {
            target.rollback().await;
            SyncOutcome::Failed(err.to_string())
        }
    }
}

/// Commit the target's staged batch
pub(crate) async fn commit(target: &dyn RemoteStore) -> Result<(), StageError> {
    target.commit().await.at(SyncStage::Creating)?;
    enter(SyncStage::Committed);
    Ok(())
}

/// Project on `store` with the given full name
pub(crate) async fn find_project(store: &dyn RemoteStore, full_name: &str) -> trackbridge_common::Result<Option<Record>> {
    store
        .query_first(&Query::new("Project").filter(Filter::eq("full_name", full_name)))
        .await
}

/// User on `store` with the given username
pub(crate) async fn find_user(store: &dyn RemoteStore, username: &str) -> trackbridge_common::Result<Option<Record>> {
    store
        .query_first(&Query::new("User").filter(Filter::eq("username", username)))
        .await
}
