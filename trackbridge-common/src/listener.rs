//! Contract between independently supervised listeners and the supervisor

use crate::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// A long-running automation bound to its own store sessions
///
/// The supervisor calls [`Listener::connect`] once; an error there is a
/// startup failure and the listener is never run. [`Listener::run`] then
/// waits for hub events until `shutdown` is cancelled, at which point it
/// closes its subscriptions and returns after in-flight work finishes.
#[async_trait]
pub trait Listener: Send {
    /// Stable name used in logs and health reports
    fn name(&self) -> &str;

    /// Open sessions and subscriptions
    async fn connect(&mut self) -> Result<()>;

    /// Process events until shutdown
    async fn run(&mut self, shutdown: CancellationToken) -> Result<()>;
}
