use std::fmt;
use std::sync::Arc;
use trackbridge_common::RemoteStore;

/// Which way entities flow for one dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    OriginToMirror,
    MirrorToOrigin,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::OriginToMirror => f.write_str("origin->mirror"),
            Direction::MirrorToOrigin => f.write_str("mirror->origin"),
        }
    }
}

/// Store sessions one dispatch loop works with
///
/// Each loop gets its own context with its own sessions, so a commit in one
/// direction never flushes work staged by the other.
#[derive(Clone)]
pub struct SyncContext {
    pub origin: Arc<dyn RemoteStore>,
    pub mirror: Arc<dyn RemoteStore>,
    pub direction: Direction,
}

impl SyncContext {
    pub fn new(origin: Arc<dyn RemoteStore>, mirror: Arc<dyn RemoteStore>, direction: Direction) -> Self {
        Self {
            origin,
            mirror,
            direction,
        }
    }

    /// Store whose hub delivered the event
    pub fn source(&self) -> &dyn RemoteStore {
        match self.direction {
            Direction::OriginToMirror => self.origin.as_ref(),
            Direction::MirrorToOrigin => self.mirror.as_ref(),
        }
    }

    /// Store receiving the mirrored entity
    pub fn target(&self) -> &dyn RemoteStore {
        match self.direction {
            Direction::OriginToMirror => self.mirror.as_ref(),
            Direction::MirrorToOrigin => self.origin.as_ref(),
        }
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "sync",
            direction = %self.direction,
            source = %self.source().server_name(),
            target = %self.target().server_name()
        )
    }
}
