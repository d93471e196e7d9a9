//! # Trackbridge Supervisor
//!
//! Runs the trackbridge listeners side by side:
//! - `sync` mirrors entities between the origin and mirror servers
//! - `shot_tasks` fills new Shots with template tasks
//! - `project_copy` serves the "Create Project from Copy" action
//!
//! Each listener gets its own thread, runtime and server sessions. The
//! health endpoint reports their state.

pub mod health;
pub mod registry;
pub mod supervisor;

pub use health::{health_routes, HealthResponse};
pub use registry::{build_supervisor, listener_factories, KNOWN_LISTENERS};
pub use supervisor::{
    ListenerExit, ListenerFactory, ListenerState, ListenerStatus, StatusBoard, Supervisor, SupervisorError,
    SupervisorReport,
};
