//! Downstream pipeline engine client
//!
//! The engine is an external collaborator reached through one call,
//! `invoke(topic_code, payload, credential)`. It must be idempotent: a unit
//! reset by the reclaimer is invoked again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use super::types::ScheduledTask;

pub const DEFAULT_PIPELINE_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Pipeline returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Pipeline client misconfigured: {0}")]
    Config(String),
}

/// Personal access token presented to the pipeline engine
#[derive(Clone)]
pub struct Credential {
    token: String,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// What the engine answered
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default)]
    pub trace_id: Option<String>,
    /// Absent means failure
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[async_trait]
pub trait PipelineInvoker: Send + Sync {
    async fn invoke(
        &self,
        topic_code: &str,
        payload: &ScheduledTask,
        credential: &Credential,
    ) -> Result<Invocation, PipelineError>;
}

#[derive(Clone)]
pub struct PipelineConfig {
    pub base_url: String,
    pub credential: Credential,
    pub timeout_secs: u64,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("base_url", &self.base_url)
            .field("credential", &self.credential)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// POSTs the envelope to `{base_url}/api/v1/pipelines/{topic_code}/invoke`
pub struct HttpPipelineInvoker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPipelineInvoker {
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(PipelineError::Config("base URL cannot be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, base_url })
    }

    fn invoke_url(&self, topic_code: &str) -> String {
        format!("{}/api/v1/pipelines/{}/invoke", self.base_url, topic_code)
    }
}

#[async_trait]
impl PipelineInvoker for HttpPipelineInvoker {
    #[instrument(skip(self, payload, credential), fields(task_id = %payload.task_id))]
    async fn invoke(
        &self,
        topic_code: &str,
        payload: &ScheduledTask,
        credential: &Credential,
    ) -> Result<Invocation, PipelineError> {
        let response = self
            .client
            .post(self.invoke_url(topic_code))
            .bearer_auth(credential.token())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let invocation: Invocation = response.json().await?;
        debug!(
            topic_code,
            trace_id = ?invocation.trace_id,
            success = invocation.success,
            "Pipeline invoked"
        );
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collector_common::{ResourceId, TenantId};
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task() -> ScheduledTask {
        ScheduledTask::new(
            TenantId::parse("acme").unwrap(),
            "t-1",
            ResourceId::from("1001"),
            "claims-sync",
            "CLAIM",
            "55",
            json!({"amount": 10}),
        )
    }

    fn invoker(server: &MockServer) -> HttpPipelineInvoker {
        HttpPipelineInvoker::new(&PipelineConfig {
            base_url: format!("{}/", server.uri()),
            credential: Credential::new("pat-123"),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/pipelines/claims-sync/invoke"))
            .and(bearer_token("pat-123"))
            .and(body_partial_json(json!({"taskId": "t-1", "modelName": "CLAIM"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "traceId": "tr-9",
                "success": true,
                "result": {"rows": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let invocation = invoker(&server)
            .invoke("claims-sync", &task(), &Credential::new("pat-123"))
            .await
            .unwrap();

        assert!(invocation.success);
        assert_eq!(invocation.trace_id.as_deref(), Some("tr-9"));
        assert_eq!(invocation.result, Some(json!({"rows": 1})));
    }

    #[tokio::test]
    async fn test_missing_success_flag_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"traceId": "tr-1"})))
            .mount(&server)
            .await;

        let invocation = invoker(&server)
            .invoke("claims-sync", &task(), &Credential::new("pat-123"))
            .await
            .unwrap();
        assert!(!invocation.success);
    }

    #[tokio::test]
    async fn test_non_2xx_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("engine down"))
            .mount(&server)
            .await;

        let err = invoker(&server)
            .invoke("claims-sync", &task(), &Credential::new("pat-123"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Status { status: 503, .. }));
        assert!(err.to_string().contains("engine down"));
    }

    #[test]
    fn test_credential_is_redacted() {
        let config = PipelineConfig {
            base_url: DEFAULT_PIPELINE_BASE_URL.to_string(),
            credential: Credential::new("super-secret"),
            timeout_secs: DEFAULT_PIPELINE_TIMEOUT_SECS,
        };
        assert!(!format!("{:?}", config).contains("super-secret"));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        let config = PipelineConfig {
            base_url: "/".to_string(),
            credential: Credential::new("x"),
            timeout_secs: 1,
        };
        assert!(matches!(HttpPipelineInvoker::new(&config), Err(PipelineError::Config(_))));
    }
}
