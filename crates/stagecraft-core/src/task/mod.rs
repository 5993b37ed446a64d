//! Tasks: named operations, their registry, and the shared retry loop.

pub mod operation;
pub mod registry;
pub mod retry;
