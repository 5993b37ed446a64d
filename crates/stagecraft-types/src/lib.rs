//! Shared domain types for stagecraft.
//!
//! Stage descriptors, retry policy, budget accounting, run records, the
//! activity journal entry, progress events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod budget;
pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod stage;
pub mod task;
pub mod workflow;
