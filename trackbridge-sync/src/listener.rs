use crate::context::{Direction, SyncContext};
use crate::dispatcher::Dispatcher;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trackbridge_common::config::SyncSettings;
use trackbridge_common::{Connector, Error, EventHub, Listener, Result, RetryPolicy, ServerSide};

struct Connected {
    origin_hub: Arc<dyn EventHub>,
    mirror_hub: Arc<dyn EventHub>,
    forward: Dispatcher,
    backward: Dispatcher,
}

/// Cross-server synchronizer
///
/// Runs two dispatch loops concurrently: origin hub events mirrored onto the
/// mirror, and mirror hub events mirrored onto the origin. Each loop has its
/// own pair of store sessions.
pub struct SyncListener {
    settings: SyncSettings,
    retry: RetryPolicy,
    connector: Arc<dyn Connector>,
    connected: Option<Connected>,
}

impl SyncListener {
    pub fn new(settings: SyncSettings, retry: RetryPolicy, connector: Arc<dyn Connector>) -> Self {
        Self {
            settings,
            retry,
            connector,
            connected: None,
        }
    }

    fn sides(&self) -> (ServerSide, ServerSide) {
        (
            ServerSide::new(&self.settings.origin_prefix, "origin"),
            ServerSide::new(&self.settings.mirror_prefix, "mirror"),
        )
    }

    async fn context(&self, direction: Direction) -> Result<SyncContext> {
        let (origin, mirror) = self.sides();
        Ok(SyncContext::new(
            self.connector.open_store(&origin).await?,
            self.connector.open_store(&mirror).await?,
            direction,
        ))
    }
}

#[async_trait]
impl Listener for SyncListener {
    fn name(&self) -> &str {
        "sync"
    }

    async fn connect(&mut self) -> Result<()> {
        let (origin, mirror) = self.sides();
        let origin_hub = self.connector.open_hub(&origin).await?;
        let mirror_hub = self.connector.open_hub(&mirror).await?;

        let forward = Dispatcher::with_default_handlers(
            self.context(Direction::OriginToMirror).await?,
            &self.settings,
            &self.retry,
        );
        let backward = Dispatcher::with_default_handlers(
            self.context(Direction::MirrorToOrigin).await?,
            &self.settings,
            &self.retry,
        );

        info!(
            origin = %origin_hub.server_name(),
            mirror = %mirror_hub.server_name(),
            "Sync listener connected"
        );
        self.connected = Some(Connected {
            origin_hub,
            mirror_hub,
            forward,
            backward,
        });
        Ok(())
    }

    async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        let Connected {
            origin_hub,
            mirror_hub,
            forward,
            backward,
        } = self
            .connected
            .take()
            .ok_or_else(|| Error::Hub("sync listener is not connected".to_string()))?;

        let capacity = self.settings.channel_capacity;
        let origin_sub = origin_hub.subscribe(&self.settings.topics, capacity).await?;
        let mirror_sub = mirror_hub.subscribe(&self.settings.topics, capacity).await?;

        // Closing both subscriptions lets each loop finish its in-flight event
        let closers = vec![origin_sub.close_token(), mirror_sub.close_token()];
        let watcher = {
            let shutdown = shutdown.clone();
            let closers = closers.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                for closer in closers {
                    closer.cancel();
                }
            })
        };

        let mut loops = JoinSet::new();
        loops.spawn(forward.run(origin_sub));
        loops.spawn(backward.run(mirror_sub));

        let mut failure = None;
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(_) if shutdown.is_cancelled() => {}
                Ok(_) => {
                    failure.get_or_insert_with(|| "event hub closed unexpectedly".to_string());
                }
                Err(e) => {
                    failure.get_or_insert_with(|| format!("dispatch loop aborted: {}", e));
                }
            }
            // One side gone: stop the other too
            for closer in &closers {
                closer.cancel();
            }
        }

        watcher.abort();
        origin_hub.close();
        mirror_hub.close();

        match failure {
            Some(reason) => {
                warn!(%reason, "Sync listener stopped");
                Err(Error::Hub(reason))
            }
            None => {
                info!("Sync listener stopped");
                Ok(())
            }
        }
    }
}
