use super::{MemoryHub, MemoryStore};
use crate::connect::{Connector, ServerSide};
use crate::hub::EventHub;
use crate::store::RemoteStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// [`Connector`] handing out in-process servers registered by prefix
///
/// Every `open_store` call returns a fresh session over the prefix's
/// [`MemoryStore`]: shared tables, separate staged batches.
#[derive(Default)]
pub struct MemoryConnector {
    servers: HashMap<String, (Arc<MemoryStore>, Arc<MemoryHub>)>,
    refused: Mutex<Vec<String>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a server under a credential prefix
    pub fn with_server(mut self, prefix: &str, store: Arc<MemoryStore>, hub: Arc<MemoryHub>) -> Self {
        self.servers.insert(prefix.to_string(), (store, hub));
        self
    }

    /// Make every later connection to `prefix` fail
    pub fn refuse(&self, prefix: &str) {
        self.refused
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prefix.to_string());
    }

    fn lookup(&self, side: &ServerSide) -> Result<&(Arc<MemoryStore>, Arc<MemoryHub>)> {
        let refused = self
            .refused
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&side.prefix);
        if refused {
            return Err(Error::connection(&side.default_name, "connection refused"));
        }
        self.servers
            .get(&side.prefix)
            .ok_or_else(|| Error::connection(&side.default_name, format!("no server registered for {}", side.prefix)))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open_store(&self, side: &ServerSide) -> Result<Arc<dyn RemoteStore>> {
        let (store, _) = self.lookup(side)?;
        Ok(Arc::new(store.session()) as Arc<dyn RemoteStore>)
    }

    async fn open_hub(&self, side: &ServerSide) -> Result<Arc<dyn EventHub>> {
        let (_, hub) = self.lookup(side)?;
        Ok(Arc::clone(hub) as Arc<dyn EventHub>)
    }
}
