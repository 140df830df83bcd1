//! Completion notifications posted to a run's webhook URL.

use chrono::Utc;
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use url::Url;

use crate::runtime::worker::WorkerResult;

pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A path-only webhook needs the server's own address to resolve against.
    #[error("webhook '{0}' is a local path but no loopback address is configured")]
    NoLoopback(String),

    #[error("unsupported webhook scheme '{0}'")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Posts run results to webhook targets.
///
/// Targets starting with `/` are routes of this server and are sent to the
/// loopback address.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    loopback: Option<Url>,
}

impl WebhookDispatcher {
    pub fn new(loopback: Option<Url>, timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, loopback })
    }

    pub fn resolve(&self, webhook: &str) -> Result<Url, WebhookError> {
        if webhook.starts_with('/') {
            let base = self
                .loopback
                .as_ref()
                .ok_or_else(|| WebhookError::NoLoopback(webhook.to_string()))?;
            return Ok(base.join(webhook)?);
        }
        let url = Url::parse(webhook)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(WebhookError::UnsupportedScheme(other.to_string())),
        }
    }

    /// The run record plus its outcome, timings, final values and error.
    pub fn payload(result: &WorkerResult) -> Value {
        let mut body = match serde_json::to_value(&result.run) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        body.insert("status".into(), json!(result.outcome.as_str()));
        body.insert("run_started_at".into(), json!(result.run_started_at));
        body.insert("run_ended_at".into(), json!(result.run_ended_at));
        body.insert("webhook_sent_at".into(), json!(Utc::now()));
        body.insert(
            "values".into(),
            result
                .checkpoint
                .as_ref()
                .map_or(Value::Null, |cp| cp.values.clone()),
        );
        if let Some(error) = &result.error {
            body.insert("error".into(), json!(error));
        }
        Value::Object(body)
    }

    #[instrument(skip_all, fields(run_id = %result.run.run_id))]
    pub async fn dispatch(&self, result: &WorkerResult) {
        let Some(webhook) = result.run.kwargs.webhook.as_deref() else {
            return;
        };
        match self.send(webhook, result).await {
            Ok(status) => info!(%status, "Webhook delivered"),
            Err(err) => {
                metrics::counter!("webhook_failures_total").increment(1);
                warn!(error = %err, "Webhook delivery failed");
            }
        }
    }

    async fn send(
        &self,
        webhook: &str,
        result: &WorkerResult,
    ) -> Result<reqwest::StatusCode, WebhookError> {
        let url = self.resolve(webhook)?;
        let response = self
            .client
            .post(url)
            .json(&Self::payload(result))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Checkpoint, MultitaskStrategy, Run, RunKwargs, RunStatus, StreamMode};
    use crate::runtime::worker::RunOutcome;
    use uuid::Uuid;

    fn dispatcher(loopback: Option<&str>) -> WebhookDispatcher {
        WebhookDispatcher::new(
            loopback.map(|u| Url::parse(u).unwrap()),
            DEFAULT_WEBHOOK_TIMEOUT,
        )
        .unwrap()
    }

    fn result() -> WorkerResult {
        let now = Utc::now();
        WorkerResult {
            run: Run {
                run_id: Uuid::new_v4(),
                thread_id: Uuid::new_v4(),
                assistant_id: Uuid::new_v4(),
                status: RunStatus::Running,
                created_at: now,
                updated_at: now,
                kwargs: RunKwargs {
                    graph_id: "echo".into(),
                    input: json!({"message": "hi"}),
                    stream_mode: vec![StreamMode::Values],
                    webhook: Some("https://hooks.example.com/done".into()),
                    temporary: false,
                    subgraphs: false,
                    resumable: false,
                    checkpoint_id: None,
                    config: Map::new(),
                    user: None,
                },
                multitask_strategy: MultitaskStrategy::Reject,
                metadata: Map::new(),
                attempt: 1,
            },
            outcome: RunOutcome::Error,
            checkpoint: Some(Checkpoint::new("cp", json!({"answer": 42}))),
            error: Some("boom".into()),
            run_started_at: now,
            run_ended_at: now,
        }
    }

    #[test]
    fn resolves_absolute_and_loopback_targets() {
        let hooks = dispatcher(Some("http://127.0.0.1:8123"));
        assert_eq!(
            hooks.resolve("/internal/hook").unwrap().as_str(),
            "http://127.0.0.1:8123/internal/hook"
        );
        assert_eq!(
            hooks.resolve("https://example.com/x").unwrap().as_str(),
            "https://example.com/x"
        );
        assert!(matches!(
            hooks.resolve("ftp://example.com"),
            Err(WebhookError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            dispatcher(None).resolve("/internal/hook"),
            Err(WebhookError::NoLoopback(_))
        ));
    }

    #[test]
    fn payload_carries_outcome_and_values() {
        let result = result();
        let body = WebhookDispatcher::payload(&result);
        assert_eq!(body["run_id"], json!(result.run.run_id));
        assert_eq!(body["status"], "error");
        assert_eq!(body["values"], json!({"answer": 42}));
        assert_eq!(body["error"], "boom");
        assert!(body.get("webhook_sent_at").is_some());
        assert!(body.get("run_started_at").is_some());
    }
}
