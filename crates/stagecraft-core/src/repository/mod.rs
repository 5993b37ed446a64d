//! Repository traits (ports) implemented by the infrastructure layer, plus
//! an in-memory implementation for tests and single-process deployments.

pub mod memory;
pub mod run;
