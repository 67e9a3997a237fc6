//! DeepInfra: synchronous provider for image and audio generation. The
//! inference call blocks until the artifact is ready and returns it inline
//! as base64, so jobs on this provider never enter `processing`.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::ContentType;

use super::{Dispatch, NormalizedRequest, Provider, ProviderError, SyncArtifact, TaskStatus};

const IMAGE_MODEL: &str = "stabilityai/sd3.5";
const AUDIO_MODEL: &str = "hexgrad/Kokoro-82M";
const MAX_PROMPT_CHARS: usize = 4000;

pub struct DeepInfra {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    audio: Option<String>,
}

impl DeepInfra {
    pub fn new(http: reqwest::Client, base_url: String, token: Option<String>) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    fn model_for(content_type: ContentType) -> &'static str {
        match content_type {
            ContentType::Audio => AUDIO_MODEL,
            _ => IMAGE_MODEL,
        }
    }
}

// responses are data URLs like "data:image/png;base64,...." or bare base64
fn decode_artifact(payload: &str) -> Result<(Vec<u8>, Option<String>), ProviderError> {
    let (mime, b64) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let mut parts = rest.splitn(2, ";base64,");
            let mime = parts.next().unwrap_or_default().to_string();
            let data = parts
                .next()
                .ok_or_else(|| ProviderError::terminal("malformed data url"))?;
            (Some(mime), data)
        }
        None => (None, payload),
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| ProviderError::terminal(format!("base64 decode: {e}")))?;
    Ok((bytes, mime))
}

#[async_trait]
impl Provider for DeepInfra {
    fn name(&self) -> &'static str {
        "deepinfra"
    }

    fn is_async(&self) -> bool {
        false
    }

    fn supports(&self, content_type: ContentType) -> bool {
        matches!(content_type, ContentType::Image | ContentType::Audio)
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

        let mut normalized = json!({ "prompt": prompt });
        if content_type == ContentType::Audio {
            let voice = params
                .get("voice")
                .and_then(|v| v.as_str())
                .unwrap_or("af_bella");
            normalized["voice"] = json!(voice);
        }

        Ok(NormalizedRequest {
            content_type,
            params: normalized,
        })
    }

    async fn dispatch(
        &self,
        request: &NormalizedRequest,
        _callback_url: &str,
    ) -> Result<Dispatch, ProviderError> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| ProviderError::terminal("deepinfra token not configured"))?;

        let model = Self::model_for(request.content_type);
        let response = self
            .http
            .post(format!("{}/v1/inference/{}", self.base_url, model))
            .bearer_auth(token)
            .json(&request.params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        let inference: InferenceResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::terminal(format!("parse response: {e}")))?;

        let (payload, default_mime) = match request.content_type {
            ContentType::Audio => (
                inference
                    .audio
                    .ok_or_else(|| ProviderError::terminal("no audio in response"))?,
                "audio/wav",
            ),
            _ => (
                inference
                    .images
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProviderError::terminal("no image in response"))?,
                "image/png",
            ),
        };

        let (bytes, mime) = decode_artifact(&payload)?;
        Ok(Dispatch::Completed(SyncArtifact {
            bytes,
            mime: mime.unwrap_or_else(|| default_mime.to_string()),
        }))
    }

    async fn check_status(&self, _task_id: &str) -> Result<TaskStatus, ProviderError> {
        // synchronous provider: there is never an outstanding task
        Err(ProviderError::terminal("status check not supported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> DeepInfra {
        DeepInfra::new(reqwest::Client::new(), base_url, Some("test-token".into()))
    }

    #[test]
    fn normalize_requires_prompt() {
        let p = provider("http://unused".into());
        assert!(p.normalize(ContentType::Image, &json!({})).is_err());
        assert!(p
            .normalize(ContentType::Image, &json!({ "prompt": "  " }))
            .is_err());

        let ok = p
            .normalize(ContentType::Image, &json!({ "prompt": "a cat" }))
            .unwrap();
        assert_eq!(ok.params["prompt"], "a cat");
    }

    #[test]
    fn normalize_defaults_voice_for_audio() {
        let p = provider("http://unused".into());
        let ok = p
            .normalize(ContentType::Audio, &json!({ "prompt": "hello" }))
            .unwrap();
        assert_eq!(ok.params["voice"], "af_bella");
    }

    #[test]
    fn decodes_data_url_and_bare_base64() {
        let (bytes, mime) = decode_artifact("data:image/png;base64,aGk=").unwrap();
        assert_eq!(bytes, b"hi");
        assert_eq!(mime.as_deref(), Some("image/png"));

        let (bytes, mime) = decode_artifact("aGk=").unwrap();
        assert_eq!(bytes, b"hi");
        assert!(mime.is_none());
    }

    #[tokio::test]
    async fn dispatch_returns_inline_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/inference/{IMAGE_MODEL}")))
            .and(bearer_token("test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "images": ["data:image/png;base64,aGk="]
            })))
            .mount(&server)
            .await;

        let p = provider(server.uri());
        let req = p
            .normalize(ContentType::Image, &json!({ "prompt": "a cat" }))
            .unwrap();

        match p.dispatch(&req, "http://cb").await.unwrap() {
            Dispatch::Completed(artifact) => {
                assert_eq!(artifact.bytes, b"hi");
                assert_eq!(artifact.mime, "image/png");
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_5xx_is_retryable_4xx_is_not() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let p = provider(server.uri());
        let req = p
            .normalize(ContentType::Image, &json!({ "prompt": "x" }))
            .unwrap();
        let err = p.dispatch(&req, "http://cb").await.unwrap_err();
        assert!(err.retryable);

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        let p = provider(server.uri());
        let err = p.dispatch(&req, "http://cb").await.unwrap_err();
        assert!(!err.retryable);
    }
}
