//! REST command client: start, stop, and rerun executions.
//!
//! Commands are opaque triggers. Their effects arrive on the event stream;
//! a failed command never touches streaming state.

use reqwest::Client;
use serde_json::{Value, json};
use thiserror::Error;

/// Command error.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Response carried no execution id")]
    MissingExecId,
}

/// Client for the backend command endpoints.
#[derive(Debug, Clone)]
pub struct CommandClient {
    base_url: String,
    client: Client,
}

impl CommandClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, CommandError> {
        let url = self.url(path);
        tracing::debug!(url = %url, "posting command");
        let response = self.client.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommandError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = response.text().await?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::Null))
    }

    /// Start a state-machine execution. Returns its execution id.
    ///
    /// # Errors
    /// Returns error if the request fails or the response has no id.
    pub async fn start(&self, request: &Value) -> Result<String, CommandError> {
        let response = self.post("state-machine/execute", request).await?;
        let exec_id = exec_id_from(&response).ok_or(CommandError::MissingExecId)?;
        tracing::info!(exec = %exec_id, "execution started");
        Ok(exec_id)
    }

    /// Ask the backend to stop an execution.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn stop(&self, exec_id: &str) -> Result<(), CommandError> {
        self.post(&format!("executions/{exec_id}/stop"), &json!({}))
            .await?;
        Ok(())
    }

    /// Rerun an execution from `state_id`.
    ///
    /// # Errors
    /// Returns error if the request fails.
    pub async fn rerun_from(&self, exec_id: &str, state_id: &str) -> Result<(), CommandError> {
        self.post(
            &format!("executions/{exec_id}/rerun_from"),
            &json!({ "state_id": state_id }),
        )
        .await?;
        Ok(())
    }
}

fn exec_id_from(response: &Value) -> Option<String> {
    ["exec_id", "execution_id", "id"]
        .iter()
        .find_map(|key| response.get(key)?.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}
