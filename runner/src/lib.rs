//! Coordination layer for running a dataset evaluation as a scheduler job array.
//!
//! Every array slot runs the same binary. Ordinal 0 publishes the instance list, every slot
//! resolves and runs its own instance, and in end-to-end mode the last ordinal waits for its
//! siblings, aggregates their results and triggers the scoring harness.

pub mod collector;
pub mod config;
pub mod distributed;
pub mod enumerate;
pub mod evaluation;
pub mod executors;
pub mod resolver;
pub mod slot;
pub mod submit;

pub use distributed::{JobId, Slot};
pub use enumerate::{InstanceList, WorkItem};
