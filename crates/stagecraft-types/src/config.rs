//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` in the data
//! directory: concurrency, default retry policy, budget ceilings, server
//! address and agent endpoint.

use serde::{Deserialize, Serialize};

use crate::budget::BudgetCeilings;
use crate::task::RetryPolicy;

/// Top-level configuration for the engine.
///
/// Loaded from `~/.stagecraft/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of stages in flight per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Capacity of the progress event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Run-level ceilings; a workflow file may override individual kinds.
    #[serde(default)]
    pub budget: BudgetCeilings,

    /// Policy for tasks registered without one.
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            event_capacity: default_event_capacity(),
            budget: BudgetCeilings::default(),
            retry: RetryPolicy::default(),
            server: ServerConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Where the HTTP agent invoker sends `call(agent, operation, input)` requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_url")]
    pub base_url: String,
    /// Transport-level request timeout. The task's retry policy bounds attempts separately.
    #[serde(default = "default_agent_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    120
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: default_agent_url(),
            timeout_secs: default_agent_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::BackoffPolicy;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.event_capacity, 256);
        assert_eq!(config.budget, BudgetCeilings::default());
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_concurrency = 2

[budget]
tokens = 100000
cost_micros = 5000000

[retry]
max_attempts = 5
timeout_ms = 30000

[retry.backoff]
type = "fixed"
delay_ms = 1000

[server]
port = 9090

[agent]
base_url = "http://agents.local:7000"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.budget.tokens, Some(100_000));
        assert_eq!(config.budget.time_ms, None);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.timeout_ms, Some(30_000));
        assert!(matches!(config.retry.backoff, BackoffPolicy::Fixed { delay_ms: 1000, .. }));
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.agent.base_url, "http://agents.local:7000");
        assert_eq!(config.agent.timeout_secs, 120);
    }
}
