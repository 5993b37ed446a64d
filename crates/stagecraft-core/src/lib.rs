//! Execution engine for stagecraft workflows.
//!
//! Defines the ports (`ExecutionBackend`, `RunRepository`, `AgentInvoker`,
//! `TaskOperation`) and the logic driving them. Depends only on
//! `stagecraft-types`: storage and HTTP live in `stagecraft-infra`.

pub mod agent;
pub mod backend;
pub mod budget;
pub mod checkpoint;
pub mod context;
pub mod controller;
pub mod definition;
pub mod event;
pub mod graph;
pub mod repository;
pub mod signal;
pub mod task;
