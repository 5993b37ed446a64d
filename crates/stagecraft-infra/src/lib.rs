//! Infrastructure layer for Stagecraft.
//!
//! Contains implementations of the ports defined in `stagecraft-core`:
//! SQLite run storage for the durable backend, the HTTP agent invoker, and
//! the `config.toml` loader.

pub mod agent;
pub mod config;
pub mod sqlite;
