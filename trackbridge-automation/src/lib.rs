//! # Trackbridge Automation
//!
//! Listeners that act on a single tracking server:
//! - [`ShotTaskListener`] fills new Shots with the template tasks
//! - [`ProjectCopyListener`] serves the "Create Project from Copy" action

pub mod project_copy;
pub mod shot_tasks;

pub use project_copy::{CopyRequest, ProjectCopier, ProjectCopyListener, ACTION_IDENTIFIER};
pub use shot_tasks::{ShotTaskListener, ShotTemplater, TemplateReport};
