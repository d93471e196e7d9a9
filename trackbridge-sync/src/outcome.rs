use std::fmt;
use tracing::{debug, error, info, warn};

/// Result of one sync attempt, used for logging and counters only
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Mirrored entity committed on the target
    Created { id: String },
    /// An equivalent entity already exists on the target
    SkippedAlreadyExists { existing_id: String },
    /// The parent (project, task or asset) has no counterpart on the target
    SkippedParentNotFound(String),
    /// The entity is not meant to be mirrored
    SkippedIneligible(String),
    /// The source entity never became readable within the retry bound
    SkippedNotVisible,
    Failed(String),
}

impl SyncOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, SyncOutcome::Created { .. })
    }

    pub fn is_skipped(&self) -> bool {
        !matches!(self, SyncOutcome::Created { .. } | SyncOutcome::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncOutcome::Failed(_))
    }

    /// Emit the outcome at its level
    ///
    /// Server and entity id come from the enclosing dispatch span.
    pub fn log(&self, handler: &str, target: &str) {
        match self {
            SyncOutcome::Created { id } => {
                info!(handler, target, created_id = %id, "Synced")
            }
            SyncOutcome::SkippedAlreadyExists { existing_id } => {
                info!(handler, target, %existing_id, "Already exists on target")
            }
            SyncOutcome::SkippedParentNotFound(missing) => {
                warn!(handler, target, %missing, "Parent not found on target")
            }
            SyncOutcome::SkippedIneligible(reason) => {
                debug!(handler, target, %reason, "Not eligible for sync")
            }
            SyncOutcome::SkippedNotVisible => {
                warn!(handler, target, "Entity not yet visible on source, event dropped")
            }
            SyncOutcome::Failed(reason) => {
                error!(handler, target, %reason, "Sync failed")
            }
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Created { id } => write!(f, "created {}", id),
            SyncOutcome::SkippedAlreadyExists { existing_id } => {
                write!(f, "skipped: already exists ({})", existing_id)
            }
            SyncOutcome::SkippedParentNotFound(missing) => {
                write!(f, "skipped: parent not found ({})", missing)
            }
            SyncOutcome::SkippedIneligible(reason) => write!(f, "skipped: {}", reason),
            SyncOutcome::SkippedNotVisible => f.write_str("skipped: not yet visible"),
            SyncOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}
