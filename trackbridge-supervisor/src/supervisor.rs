//! Listener supervisor
//!
//! Every registered listener runs on its own named OS thread with its own
//! Tokio runtime, so a blocking call or a panic in one cannot stall the
//! others. A listener that fails to connect is marked failed and left alone.
//! A listener that errors or panics after connecting is rebuilt from its
//! factory and restarted, up to the configured number of times.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use trackbridge_common::config::SupervisorSettings;
use trackbridge_common::Listener;

/// Builds a fresh listener for every (re)start
pub type ListenerFactory = Arc<dyn Fn() -> Box<dyn Listener> + Send + Sync>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("No listeners to run")]
    NoListeners,

    #[error("Unknown listener: {0}")]
    UnknownListener(String),

    #[error("Listener {0} registered twice")]
    DuplicateListener(String),

    #[error("Could not start thread for {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Pending,
    Connecting,
    Running,
    Restarting,
    Stopped,
    Failed,
    /// Did not stop within the shutdown grace period
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerStatus {
    pub name: String,
    pub state: ListenerState,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared view of every listener's state, read by the health endpoint
#[derive(Clone, Default)]
pub struct StatusBoard {
    inner: Arc<Mutex<BTreeMap<String, ListenerStatus>>>,
}

impl StatusBoard {
    fn with<R>(&self, f: impl FnOnce(&mut BTreeMap<String, ListenerStatus>) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn add(&self, name: &str) {
        self.with(|map| {
            map.insert(
                name.to_string(),
                ListenerStatus {
                    name: name.to_string(),
                    state: ListenerState::Pending,
                    restarts: 0,
                    last_error: None,
                },
            );
        });
    }

    pub fn set_state(&self, name: &str, state: ListenerState) {
        self.with(|map| {
            if let Some(status) = map.get_mut(name) {
                status.state = state;
            }
        });
    }

    fn record_error(&self, name: &str, message: &str) {
        self.with(|map| {
            if let Some(status) = map.get_mut(name) {
                status.last_error = Some(message.to_string());
            }
        });
    }

    fn count_restart(&self, name: &str) -> u32 {
        self.with(|map| match map.get_mut(name) {
            Some(status) => {
                status.restarts += 1;
                status.restarts
            }
            None => 0,
        })
    }

    pub fn get(&self, name: &str) -> Option<ListenerStatus> {
        self.with(|map| map.get(name).cloned())
    }

    /// All listeners, ordered by name
    pub fn snapshot(&self) -> Vec<ListenerStatus> {
        self.with(|map| map.values().cloned().collect())
    }

    pub fn all_running(&self) -> bool {
        self.with(|map| !map.is_empty() && map.values().all(|s| s.state == ListenerState::Running))
    }
}

/// How one listener's thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// Stopped on shutdown
    Stopped,
    /// Never connected
    ConnectFailed,
    /// Crashed more often than the restart budget allows
    GaveUp,
}

/// Result of a supervisor run
#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub exits: BTreeMap<String, ListenerExit>,
    /// Listeners still running when the grace period ran out
    pub abandoned: Vec<String>,
}

impl SupervisorReport {
    /// Process exit code: 0 only when every listener connected and stopped cleanly
    pub fn exit_code(&self) -> u8 {
        let failed = self
            .exits
            .values()
            .any(|exit| matches!(exit, ListenerExit::ConnectFailed | ListenerExit::GaveUp));
        if failed {
            1
        } else {
            0
        }
    }
}

struct Registration {
    name: String,
    factory: ListenerFactory,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    registrations: Vec<Registration>,
    board: StatusBoard,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("settings", &self.settings)
            .field("listeners", &self.names())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            registrations: Vec::new(),
            board: StatusBoard::default(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: ListenerFactory) -> Result<(), SupervisorError> {
        let name = name.into();
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(SupervisorError::DuplicateListener(name));
        }
        self.board.add(&name);
        self.registrations.push(Registration { name, factory });
        Ok(())
    }

    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn board(&self) -> StatusBoard {
        self.board.clone()
    }

    /// Run every listener until `shutdown` fires or none is left running
    pub async fn run(self, shutdown: CancellationToken) -> Result<SupervisorReport, SupervisorError> {
        if self.registrations.is_empty() {
            return Err(SupervisorError::NoListeners);
        }

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<(String, ListenerExit)>();
        let total = self.registrations.len();
        for registration in self.registrations {
            let name = registration.name.clone();
            let worker = Worker {
                name: registration.name,
                factory: registration.factory,
                settings: self.settings.clone(),
                board: self.board.clone(),
                shutdown: shutdown.clone(),
                exits: exit_tx.clone(),
            };
            std::thread::Builder::new()
                .name(format!("tb-{}", name))
                .spawn(move || worker.run())
                .map_err(|source| {
                    // Stop whatever was already started
                    shutdown.cancel();
                    SupervisorError::Spawn { name, source }
                })?;
        }
        drop(exit_tx);
        info!(listeners = total, "Supervisor started");

        let mut report = SupervisorReport::default();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                exit = exit_rx.recv() => match exit {
                    Some((name, exit)) => {
                        report.exits.insert(name, exit);
                        if report.exits.len() == total {
                            warn!("No listener left running");
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        if report.exits.len() < total {
            shutdown.cancel();
            let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
            info!(grace_secs = grace.as_secs(), "Waiting for listeners to stop");
            let deadline = tokio::time::Instant::now() + grace;
            while report.exits.len() < total {
                match tokio::time::timeout_at(deadline, exit_rx.recv()).await {
                    Ok(Some((name, exit))) => {
                        report.exits.insert(name, exit);
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }

        for status in self.board.snapshot() {
            if !report.exits.contains_key(&status.name) {
                error!(listener = %status.name, "Listener did not stop in time, abandoning its thread");
                self.board.set_state(&status.name, ListenerState::Abandoned);
                report.abandoned.push(status.name);
            }
        }

        info!(exit_code = report.exit_code(), "Supervisor finished");
        Ok(report)
    }
}

struct Worker {
    name: String,
    factory: ListenerFactory,
    settings: SupervisorSettings,
    board: StatusBoard,
    shutdown: CancellationToken,
    exits: mpsc::UnboundedSender<(String, ListenerExit)>,
}

impl Worker {
    /// Thread body
    fn run(self) {
        let exit = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime.block_on(self.supervise()),
            Err(e) => {
                error!(listener = %self.name, error = %e, "Could not build runtime");
                self.board.record_error(&self.name, &e.to_string());
                self.board.set_state(&self.name, ListenerState::Failed);
                ListenerExit::ConnectFailed
            }
        };
        // Receiver gone means the supervisor already gave up on this thread
        let _ = self.exits.send((self.name.clone(), exit));
    }

    fn fail(&self, message: &str) {
        self.board.record_error(&self.name, message);
        self.board.set_state(&self.name, ListenerState::Failed);
    }

    async fn supervise(&self) -> ListenerExit {
        let name = self.name.as_str();
        let mut started = false;

        loop {
            let mut listener = (self.factory)();
            self.board.set_state(name, ListenerState::Connecting);
            debug!(listener = name, kind = listener.name(), "Connecting");

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.board.set_state(name, ListenerState::Stopped);
                    return ListenerExit::Stopped;
                }
                result = AssertUnwindSafe(listener.connect()).catch_unwind() => flatten(result),
            };

            let failure = match connected {
                Err(message) if !started => {
                    error!(listener = name, error = %message, "Listener failed to connect");
                    self.fail(&message);
                    return ListenerExit::ConnectFailed;
                }
                Err(message) => message,
                Ok(()) => {
                    started = true;
                    self.board.set_state(name, ListenerState::Running);
                    info!(listener = name, "Listener running");

                    let result = AssertUnwindSafe(listener.run(self.shutdown.clone()))
                        .catch_unwind()
                        .await;
                    match flatten(result) {
                        Ok(()) => {
                            info!(listener = name, "Listener stopped");
                            self.board.set_state(name, ListenerState::Stopped);
                            return ListenerExit::Stopped;
                        }
                        Err(_) if self.shutdown.is_cancelled() => {
                            self.board.set_state(name, ListenerState::Stopped);
                            return ListenerExit::Stopped;
                        }
                        Err(message) => message,
                    }
                }
            };
            drop(listener);

            self.board.record_error(name, &failure);
            let restarts = self.board.get(name).map_or(0, |s| s.restarts);
            if restarts >= self.settings.max_restarts {
                error!(listener = name, error = %failure, restarts, "Listener keeps failing, giving up");
                self.board.set_state(name, ListenerState::Failed);
                return ListenerExit::GaveUp;
            }
            let restarts = self.board.count_restart(name);

            let backoff = Duration::from_millis(self.settings.restart_backoff_ms.saturating_mul(u64::from(restarts)));
            warn!(
                listener = name,
                error = %failure,
                restart = restarts,
                backoff_ms = backoff.as_millis() as u64,
                "Listener crashed, restarting"
            );
            self.board.set_state(name, ListenerState::Restarting);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.board.set_state(name, ListenerState::Stopped);
                    return ListenerExit::Stopped;
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

fn flatten(
    result: std::thread::Result<trackbridge_common::Result<()>>,
) -> Result<(), String> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
