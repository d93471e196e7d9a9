//! In-process store and hub
//!
//! Behave like a tracking server session and its event hub without a
//! network: staged batches, reference-following filters, schema declarations,
//! delayed visibility and injectable failures. Integration tests across the
//! workspace drive the listeners through these.

mod connector;
mod hub;
mod store;

pub use connector::MemoryConnector;
pub use hub::MemoryHub;
pub use store::MemoryStore;
