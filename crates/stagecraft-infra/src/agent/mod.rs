//! Agent invoker implementations.

pub mod http;
