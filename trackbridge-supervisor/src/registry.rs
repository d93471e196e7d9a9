//! Listener registration from the bootstrap config

use crate::supervisor::{ListenerFactory, Supervisor, SupervisorError};
use std::sync::Arc;
use tracing::info;
use trackbridge_automation::{ProjectCopyListener, ShotTaskListener};
use trackbridge_common::config::TomlConfig;
use trackbridge_common::{Connector, Listener, RetryPolicy};
use trackbridge_sync::SyncListener;

pub const SYNC: &str = "sync";
pub const SHOT_TASKS: &str = "shot_tasks";
pub const PROJECT_COPY: &str = "project_copy";

pub const KNOWN_LISTENERS: &[&str] = &[SYNC, SHOT_TASKS, PROJECT_COPY];

/// Factories for every listener enabled in `config`, in a fixed order
pub fn listener_factories(config: &TomlConfig, connector: Arc<dyn Connector>) -> Vec<(&'static str, ListenerFactory)> {
    let retry = RetryPolicy::from(&config.retry);
    let mut factories: Vec<(&'static str, ListenerFactory)> = Vec::new();

    if config.sync.enabled {
        let (settings, retry, connector) = (config.sync.clone(), retry.clone(), connector.clone());
        let factory: ListenerFactory = Arc::new(move || -> Box<dyn Listener> {
            Box::new(SyncListener::new(settings.clone(), retry.clone(), connector.clone()))
        });
        factories.push((SYNC, factory));
    }
    if config.shot_tasks.enabled {
        let (settings, retry, connector) = (config.shot_tasks.clone(), retry.clone(), connector.clone());
        let factory: ListenerFactory = Arc::new(move || -> Box<dyn Listener> {
            Box::new(ShotTaskListener::new(settings.clone(), retry.clone(), connector.clone()))
        });
        factories.push((SHOT_TASKS, factory));
    }
    if config.project_copy.enabled {
        let settings = config.project_copy.clone();
        let factory: ListenerFactory = Arc::new(move || -> Box<dyn Listener> {
            Box::new(ProjectCopyListener::new(settings.clone(), connector.clone()))
        });
        factories.push((PROJECT_COPY, factory));
    }
    factories
}

/// Build a supervisor running the enabled listeners
///
/// A non-empty `only` restricts the run to the named listeners.
pub fn build_supervisor(
    config: &TomlConfig,
    only: &[String],
    connector: Arc<dyn Connector>,
) -> Result<Supervisor, SupervisorError> {
    if let Some(unknown) = only.iter().find(|name| !KNOWN_LISTENERS.contains(&name.as_str())) {
        return Err(SupervisorError::UnknownListener(unknown.clone()));
    }

    let mut supervisor = Supervisor::new(config.supervisor.clone());
    for (name, factory) in listener_factories(config, connector) {
        if !only.is_empty() && !only.iter().any(|o| o == name) {
            info!(listener = name, "Listener not selected, skipping");
            continue;
        }
        supervisor.register(name, factory)?;
    }
    if supervisor.names().is_empty() {
        return Err(SupervisorError::NoListeners);
    }
    Ok(supervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackbridge_common::memory::MemoryConnector;

    fn connector() -> Arc<dyn Connector> {
        Arc::new(MemoryConnector::new())
    }

    #[test]
    fn test_all_enabled_by_default() {
        let supervisor = build_supervisor(&TomlConfig::default(), &[], connector()).unwrap();
        assert_eq!(supervisor.names(), vec![SYNC, SHOT_TASKS, PROJECT_COPY]);
    }

    #[test]
    fn test_only_selects_listeners() {
        let only = vec![PROJECT_COPY.to_string()];
        let supervisor = build_supervisor(&TomlConfig::default(), &only, connector()).unwrap();
        assert_eq!(supervisor.names(), vec![PROJECT_COPY]);
    }

    #[test]
    fn test_unknown_listener_is_rejected() {
        let only = vec!["nightly".to_string()];
        let err = build_supervisor(&TomlConfig::default(), &only, connector()).unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownListener(name) if name == "nightly"));
    }

    #[test]
    fn test_disabled_listener_is_skipped() {
        let mut config = TomlConfig::default();
        config.sync.enabled = false;
        config.shot_tasks.enabled = false;
        config.project_copy.enabled = false;

        let err = build_supervisor(&config, &[], connector()).unwrap_err();
        assert!(matches!(err, SupervisorError::NoListeners));
    }
}
