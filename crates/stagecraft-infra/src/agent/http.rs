//! HTTP agent invoker.
//!
//! POSTs `{agent, operation, input}` as JSON to `{base_url}/invoke` and
//! expects `{output, usage?}` back. Failures are classified by status code so
//! the retry policy can tell transient trouble from permanent rejection.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use stagecraft_core::agent::{AgentInvoker, AgentResponse};
use stagecraft_types::config::AgentConfig;
use stagecraft_types::error::TaskError;

#[derive(Debug, thiserror::Error)]
pub enum HttpAgentError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Serialize)]
struct InvokeRequest<'a> {
    agent: &'a str,
    operation: &'a str,
    input: Value,
}

/// Calls agents over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAgentInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentInvoker {
    pub fn new(config: &AgentConfig) -> Result<Self, HttpAgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self) -> String {
        format!("{}/invoke", self.base_url)
    }
}

impl AgentInvoker for HttpAgentInvoker {
    async fn call(
        &self,
        agent: &str,
        operation: &str,
        input: Value,
    ) -> Result<AgentResponse, TaskError> {
        let body = InvokeRequest {
            agent,
            operation,
            input,
        };

        let response = self
            .client
            .post(self.url())
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            tracing::debug!(agent, operation, %status, "agent call rejected");
            return Err(classify_status(status, &error_body));
        }

        response
            .json::<AgentResponse>()
            .await
            .map_err(|e| TaskError::permanent(format!("malformed agent response: {e}")))
    }
}

/// Map a non-success status to a task error.
///
/// 408, 429 and 5xx are retryable; everything else is the caller's fault.
pub fn classify_status(status: StatusCode, body: &str) -> TaskError {
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    match status.as_u16() {
        408 => TaskError::timeout(message),
        429 => TaskError::transient(message),
        s if s >= 500 => TaskError::transient(message),
        _ => TaskError::permanent(message),
    }
}

fn classify_transport(err: reqwest::Error) -> TaskError {
    if err.is_timeout() {
        TaskError::timeout(format!("agent request timed out: {err}"))
    } else if err.is_connect() || err.is_request() {
        TaskError::transient(format!("agent unreachable: {err}"))
    } else {
        TaskError::permanent(format!("agent request failed: {err}"))
    }
}
