//! Opening store sessions and event hubs for one side of a listener

use crate::config::ServerCredentials;
use crate::ftrack::{FtrackHub, FtrackStore};
use crate::hub::EventHub;
use crate::retry::RetryPolicy;
use crate::store::RemoteStore;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Which server a listener talks to, named by its credential prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSide {
    /// Environment prefix, e.g. `TB_ORIGIN`
    pub prefix: String,
    /// Display name used when `{prefix}_SERVER_NAME` is unset
    pub default_name: String,
}

impl ServerSide {
    pub fn new(prefix: impl Into<String>, default_name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            default_name: default_name.into(),
        }
    }
}

/// Factory for the sessions a listener needs
///
/// Every call opens a new, independent session so listeners (and the two
/// sync directions) never share a pending batch.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open_store(&self, side: &ServerSide) -> Result<Arc<dyn RemoteStore>>;

    async fn open_hub(&self, side: &ServerSide) -> Result<Arc<dyn EventHub>>;
}

/// Connector for real tracking servers, credentials read from the environment
pub struct FtrackConnector {
    retry: RetryPolicy,
}

impl FtrackConnector {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }
}

#[async_trait]
impl Connector for FtrackConnector {
    async fn open_store(&self, side: &ServerSide) -> Result<Arc<dyn RemoteStore>> {
        let credentials = ServerCredentials::from_env(&side.prefix, &side.default_name)?;
        let store = FtrackStore::connect(credentials, &self.retry).await?;
        Ok(Arc::new(store))
    }

    async fn open_hub(&self, side: &ServerSide) -> Result<Arc<dyn EventHub>> {
        let credentials = ServerCredentials::from_env(&side.prefix, &side.default_name)?;
        let hub = FtrackHub::connect(&credentials).await?;
        Ok(Arc::new(hub))
    }
}
