//! # Trackbridge Sync
//!
//! Cross-server synchronizer: mirrors Task, Note and AssetVersion creations
//! between an origin and a mirror tracking server, in both directions.
//!
//! **Pipeline (per event):**
//! 1. A hub delivers a raw event into its subscription queue
//! 2. The dispatcher normalizes it and picks the first matching handler
//! 3. The handler Retry-Fetches the entity on the source, resolves the
//!    target parent by name, checks the idempotency key and commits the copy
//!
//! Identity across servers is re-resolved by name on every event; nothing is
//! cached between events.

pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod listener;
pub mod outcome;

pub use context::{Direction, SyncContext};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use handlers::{AssetVersionSync, NoteSync, SyncHandler, SyncStage, TaskSync};
pub use listener::SyncListener;
pub use outcome::SyncOutcome;
