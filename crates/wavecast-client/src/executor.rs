use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use wavecast_core::error::AppError;
use wavecast_core::item::Stage;
use wavecast_core::job::StageFailure;
use wavecast_core::traits::{StageExecutor, StageInput};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the external stage runner lives and how to talk to it.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl ExecutorConfig {
    /// Read configuration from environment variables.
    ///
    /// - `WAVECAST_EXECUTOR_URL` (required)
    /// - `WAVECAST_EXECUTOR_TOKEN` (optional bearer token)
    /// - `WAVECAST_EXECUTOR_TIMEOUT_SECS` (optional, defaults to 300)
    pub fn from_env() -> Result<Self, AppError> {
        let base_url = std::env::var("WAVECAST_EXECUTOR_URL").map_err(|_| {
            AppError::ConfigError(
                "WAVECAST_EXECUTOR_URL not set. Required to run stage workers.".into(),
            )
        })?;
        let token = std::env::var("WAVECAST_EXECUTOR_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());
        let timeout = match std::env::var("WAVECAST_EXECUTOR_TIMEOUT_SECS") {
            Err(_) => DEFAULT_TIMEOUT,
            Ok(raw) => parse_timeout(&raw)?,
        };

        Ok(Self {
            base_url,
            token,
            timeout,
        })
    }
}

fn parse_timeout(raw: &str) -> Result<Duration, AppError> {
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(AppError::ConfigError(format!(
            "WAVECAST_EXECUTOR_TIMEOUT_SECS must be a positive integer, got '{raw}'"
        ))),
    }
}

/// Stage executor that delegates every stage to an external runner service.
///
/// Each execution is one `POST {base}/stages/{stage}` carrying the item's
/// artifacts and, for publications, the channel's credential scope. The
/// runner answers `{"artifact_ref": "..."}` on success.
///
/// Failures are classified here:
/// - timeouts, connection errors, 429 and 5xx are transient
/// - any other 4xx, or a malformed success body, is permanent
#[derive(Clone)]
pub struct HttpStageExecutor {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout_secs: u64,
}

impl HttpStageExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self, AppError> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            AppError::ConfigError(format!("Invalid executor URL '{}': {e}", config.base_url))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AppError::ConfigError(format!(
                "Executor URL scheme '{}' not allowed, use http or https",
                base_url.scheme()
            )));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            timeout_secs: config.timeout.as_secs(),
        })
    }

    fn stage_url(&self, stage: Stage) -> String {
        format!(
            "{}/stages/{}",
            self.base_url.as_str().trim_end_matches('/'),
            stage.as_str()
        )
    }
}

// ---- Runner API types ----

#[derive(Serialize)]
struct StageRequest<'a> {
    job_id: Uuid,
    item_id: Uuid,
    stage: Stage,
    source_ref: &'a str,
    artifacts: &'a BTreeMap<Stage, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    credential_scope: Option<&'a str>,
    attempt: u32,
}

#[derive(Deserialize)]
struct StageResponse {
    artifact_ref: String,
}

#[derive(Deserialize)]
struct RunnerError {
    error: String,
}

/// Failure for a non-success HTTP status.
fn classify_status(status: StatusCode, message: String) -> StageFailure {
    if status == StatusCode::TOO_MANY_REQUESTS {
        StageFailure::rate_limited(message)
    } else if status.is_server_error() {
        StageFailure::transient(message)
    } else {
        StageFailure::permanent(message)
    }
}

impl StageExecutor for HttpStageExecutor {
    async fn execute(&self, input: &StageInput) -> Result<String, StageFailure> {
        let url = self.stage_url(input.stage);
        let request = StageRequest {
            job_id: input.job_id,
            item_id: input.item_id,
            stage: input.stage,
            source_ref: &input.source_ref,
            artifacts: &input.artifacts,
            channel_id: input.channel_id,
            credential_scope: input.credential.as_ref().map(|c| c.as_str()),
            attempt: input.attempt,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            let err = if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            };
            StageFailure::from(err)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<RunnerError>(&body)
                .map(|e| e.error)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status.as_u16(), body));
            tracing::debug!(
                job_id = %input.job_id,
                stage = %input.stage,
                status = status.as_u16(),
                %message,
                "Stage runner rejected request"
            );
            return Err(classify_status(status, message));
        }

        let parsed: StageResponse = response.json().await.map_err(|e| {
            StageFailure::permanent(format!("Failed to parse stage runner response: {e}"))
        })?;
        if parsed.artifact_ref.trim().is_empty() {
            return Err(StageFailure::permanent(
                "Stage runner returned an empty artifact reference",
            ));
        }

        Ok(parsed.artifact_ref)
    }
}
