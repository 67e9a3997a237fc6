//! Provider plugins: a normalized dispatch contract over external
//! generation services. A provider either returns the finished artifact
//! inline (synchronous) or a task handle that later resolves via webhook
//! (asynchronous); async providers may additionally expose a status-check
//! endpoint, which is what makes them recoverable.

pub mod deepinfra;
pub mod replicate;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::config::Config;
use crate::error::ApiError;
use crate::models::ContentType;

/// Parameters after the provider's own validation/coercion pass. Opaque to
/// the orchestrator.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub content_type: ContentType,
    pub params: serde_json::Value,
}

#[derive(Debug)]
pub struct SyncArtifact {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[derive(Debug)]
pub enum Dispatch {
    /// Finished artifact returned inline.
    Completed(SyncArtifact),
    /// Work accepted; completion arrives via webhook or status check.
    Accepted { task_id: String },
}

#[derive(Debug)]
pub enum TaskStatus {
    Processing,
    Succeeded { output_url: String },
    Failed { reason: String },
}

/// Upstream failure, kept internal. `retryable` distinguishes
/// timeout/connect/5xx/429 from a terminal 4xx. Messages are for logs only
/// and must never reach an end user verbatim.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub retryable: bool,
    pub message: String,
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
        Self {
            retryable,
            message: format!("upstream {status}: {body}"),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            retryable: e.is_timeout() || e.is_connect(),
            message: format!("request failed: {e}"),
        }
    }
}

/// Providers report output as either a bare url string or an array of urls;
/// we take the first.
pub fn first_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => items
            .first()
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

impl From<&ProviderError> for ApiError {
    fn from(e: &ProviderError) -> Self {
        ApiError::Provider {
            retryable: e.retryable,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether completion arrives via webhook rather than inline.
    fn is_async(&self) -> bool;

    fn supports(&self, content_type: ContentType) -> bool;

    /// Validate and coerce caller-supplied parameters. No side effects.
    fn normalize(
        &self,
        content_type: ContentType,
        params: &serde_json::Value,
    ) -> Result<NormalizedRequest, ApiError>;

    async fn dispatch(
        &self,
        request: &NormalizedRequest,
        callback_url: &str,
    ) -> Result<Dispatch, ProviderError>;

    /// Providers without a status endpoint are excluded from recovery.
    fn can_check_status(&self) -> bool {
        false
    }

    async fn check_status(&self, _task_id: &str) -> Result<TaskStatus, ProviderError> {
        Err(ProviderError::terminal("status check not supported"))
    }

    fn cost_multiplier(&self) -> f64 {
        1.0
    }

    /// Secret used to verify this provider's webhook signatures, when async.
    fn webhook_secret(&self) -> Option<&str> {
        None
    }
}

pub struct ProviderRegistry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config, http: reqwest::Client) -> Self {
        let mut providers: HashMap<&'static str, Arc<dyn Provider>> = HashMap::new();

        let di = deepinfra::DeepInfra::new(
            http.clone(),
            config.deepinfra_base_url.clone(),
            config.deepinfra_token.clone(),
        );
        providers.insert(di.name(), Arc::new(di));

        let rep = replicate::Replicate::new(
            http,
            config.replicate_base_url.clone(),
            config.replicate_token.clone(),
            config.replicate_webhook_secret.clone(),
        );
        providers.insert(rep.name(), Arc::new(rep));

        Self { providers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.providers.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_retryable() {
        assert!(ProviderError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "").retryable);
        assert!(ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, "").retryable);
        assert!(!ProviderError::from_status(StatusCode::BAD_REQUEST, "").retryable);
        assert!(!ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "").retryable);
    }

    #[test]
    fn provider_error_sanitizes_to_api_error() {
        let upstream = ProviderError::terminal("secret-key leaked in upstream body");
        let api: ApiError = (&upstream).into();
        assert!(!api.to_string().contains("secret-key"));
    }

    #[test]
    fn first_output_handles_string_and_array() {
        use serde_json::json;

        assert_eq!(
            first_output_url(&json!("https://x/y.png")).unwrap(),
            "https://x/y.png"
        );
        assert_eq!(
            first_output_url(&json!(["https://a", "https://b"])).unwrap(),
            "https://a"
        );
        assert!(first_output_url(&json!(42)).is_none());
        assert!(first_output_url(&json!({})).is_none());
    }
}
