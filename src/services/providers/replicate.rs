//! Replicate: asynchronous provider for image and video generation. Dispatch
//! creates a prediction carrying our callback URL; completion arrives via
//! webhook. The predictions endpoint doubles as the status check, so stuck
//! jobs on this provider are recoverable.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::ContentType;

use super::{first_output_url, Dispatch, NormalizedRequest, Provider, ProviderError, TaskStatus};

const IMAGE_MODEL: &str = "black-forest-labs/flux-schnell";
const VIDEO_MODEL: &str = "minimax/video-01";
const MAX_PROMPT_CHARS: usize = 4000;

pub struct Replicate {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    webhook_secret: Option<String>,
}

#[derive(Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl Replicate {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        token: Option<String>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url,
            token,
            webhook_secret,
        }
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.token
            .as_deref()
            .ok_or_else(|| ProviderError::terminal("replicate token not configured"))
    }
}

fn map_prediction(prediction: Prediction) -> Result<TaskStatus, ProviderError> {
    match prediction.status.as_str() {
        "starting" | "processing" => Ok(TaskStatus::Processing),
        "succeeded" => {
            let url = prediction
                .output
                .as_ref()
                .and_then(first_output_url)
                .ok_or_else(|| ProviderError::terminal("succeeded with no output"))?;
            Ok(TaskStatus::Succeeded { output_url: url })
        }
        "failed" | "canceled" => Ok(TaskStatus::Failed {
            reason: prediction
                .error
                .unwrap_or_else(|| prediction.status.clone()),
        }),
        other => Err(ProviderError::retryable(format!(
            "unknown prediction status: {other}"
        ))),
    }
}

#[async_trait]
impl Provider for Replicate {
    fn name(&self) -> &'static str {
        "replicate"
    }

    fn is_async(&self) -> bool {
        true
    }

    fn supports(&self, content_type: ContentType) -> bool {
        matches!(content_type, ContentType::Image | ContentType::Video)
    }

    fn normalize(
        &self,
        content_type: ContentType,
        params: &serde_json::Value,
    ) -> Result<NormalizedRequest, ApiError> {
        let prompt = params
            .get("prompt")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ApiError::Validation("prompt is required".into()))?;

        if prompt.len() > MAX_PROMPT_CHARS {
            return Err(ApiError::Validation("prompt too long".into()));
        }

        let model = match content_type {
            ContentType::Video => VIDEO_MODEL,
            _ => IMAGE_MODEL,
        };

        Ok(NormalizedRequest {
            content_type,
            params: json!({
                "model": model,
                "input": { "prompt": prompt },
            }),
        })
    }

    async fn dispatch(
        &self,
        request: &NormalizedRequest,
        callback_url: &str,
    ) -> Result<Dispatch, ProviderError> {
        let token = self.token()?;

        let mut body = request.params.clone();
        body["webhook"] = json!(callback_url);
        body["webhook_events_filter"] = json!(["completed"]);

        let response = self
            .http
            .post(format!("{}/v1/predictions", self.base_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let prediction: Prediction = response
            .json()
            .await
            .map_err(|e| ProviderError::terminal(format!("parse response: {e}")))?;

        Ok(Dispatch::Accepted {
            task_id: prediction.id,
        })
    }

    fn can_check_status(&self) -> bool {
        true
    }

    async fn check_status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let token = self.token()?;

        let response = self
            .http
            .get(format!("{}/v1/predictions/{}", self.base_url, task_id))
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let prediction: Prediction = response
            .json()
            .await
            .map_err(|e| ProviderError::terminal(format!("parse response: {e}")))?;

        map_prediction(prediction)
    }

    fn cost_multiplier(&self) -> f64 {
        1.5
    }

    fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> Replicate {
        Replicate::new(
            reqwest::Client::new(),
            base_url,
            Some("test-token".into()),
            Some("whsec".into()),
        )
    }

    #[tokio::test]
    async fn dispatch_carries_callback_and_returns_task_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .and(body_partial_json(json!({
                "webhook": "http://cb/webhooks/replicate?token=abc"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "pred-123",
                "status": "starting"
            })))
            .mount(&server)
            .await;

        let p = provider(server.uri());
        let req = p
            .normalize(ContentType::Video, &json!({ "prompt": "a storm" }))
            .unwrap();

        match p
            .dispatch(&req, "http://cb/webhooks/replicate?token=abc")
            .await
            .unwrap()
        {
            Dispatch::Accepted { task_id } => assert_eq!(task_id, "pred-123"),
            other => panic!("expected accepted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn check_status_maps_prediction_states() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p1", "status": "processing"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p2", "status": "succeeded",
                "output": ["https://cdn.example.com/out.mp4"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p3", "status": "failed", "error": "NSFW content"
            })))
            .mount(&server)
            .await;

        let p = provider(server.uri());

        assert!(matches!(
            p.check_status("p1").await.unwrap(),
            TaskStatus::Processing
        ));
        match p.check_status("p2").await.unwrap() {
            TaskStatus::Succeeded { output_url } => {
                assert_eq!(output_url, "https://cdn.example.com/out.mp4")
            }
            other => panic!("expected succeeded, got {other:?}"),
        }
        assert!(matches!(
            p.check_status("p3").await.unwrap(),
            TaskStatus::Failed { .. }
        ));
    }

    #[test]
    fn succeeded_without_output_is_terminal_error() {
        let err = map_prediction(Prediction {
            id: "p".into(),
            status: "succeeded".into(),
            output: None,
            error: None,
        })
        .unwrap_err();
        assert!(!err.retryable);
    }
}
