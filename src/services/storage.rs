use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client as S3Client};
use tracing::{error, info};

use crate::config::Config;
use crate::error::{ApiError, Result};

const MAX_MIRROR_BYTES: usize = 256 * 1024 * 1024;

pub struct StorageService {
    s3_client: S3Client,
    http: reqwest::Client,
    bucket: String,
    public_url: String,
}

impl StorageService {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        let creds = Credentials::new(
            &config.minio_access_key,
            &config.minio_secret_key,
            None,
            None,
            "minio",
        );

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version_latest()
            .region(Region::new("us-east-1"))
            .endpoint_url(&config.minio_endpoint)
            .credentials_provider(creds)
            .force_path_style(true)
            .build();

        Self {
            s3_client: S3Client::from_conf(s3_config),
            http,
            bucket: config.s3_bucket.clone(),
            public_url: config.media_public_url.clone(),
        }
    }

    pub async fn ensure_bucket_exists(&self) -> Result<()> {
        match self.s3_client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(_) => {
                self.s3_client
                    .create_bucket()
                    .bucket(&self.bucket)
                    .send()
                    .await
                    .map_err(|e| {
                        error!("bucket create failed: {e:?}");
                        ApiError::InternalError
                    })?;
                info!("Created bucket: {}", self.bucket);
                Ok(())
            }
        }
    }

    /// Upload artifact bytes and return the public URL.
    pub async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String> {
        self.s3_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| {
                error!("S3 upload failed: {e:?}");
                ApiError::InternalError
            })?;

        Ok(format!("{}/{}", self.public_url, key))
    }

    /// Download an artifact from a provider-hosted URL for mirroring.
    pub async fn fetch_remote(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let response = self.http.get(url).send().await.map_err(|e| {
            error!("artifact fetch failed: {e:?}");
            ApiError::InternalError
        })?;

        if !response.status().is_success() {
            error!("artifact fetch returned {}", response.status());
            return Err(ApiError::InternalError);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        // reject declared-oversize bodies before buffering anything
        if let Some(len) = response.content_length() {
            if len > MAX_MIRROR_BYTES as u64 {
                error!("artifact too large to mirror: {len} bytes");
                return Err(ApiError::InternalError);
            }
        }

        let bytes = read_capped(response, MAX_MIRROR_BYTES).await?;
        Ok((bytes, content_type))
    }
}

/// Stream the body with a running size cap; chunked responses without a
/// content-length can never buffer more than `cap` bytes.
async fn read_capped(mut response: reqwest::Response, cap: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| {
        error!("artifact read failed: {e:?}");
        ApiError::InternalError
    })? {
        if buf.len() + chunk.len() > cap {
            error!("artifact exceeds mirror cap of {cap} bytes");
            return Err(ApiError::InternalError);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

pub fn artifact_key(job_id: uuid::Uuid, mime: &str) -> String {
    let extension = match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        _ => "bin",
    };
    format!("artifacts/{job_id}.{extension}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn remote_read_respects_byte_cap() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/artifact", server.uri());

        let response = client.get(&url).send().await.unwrap();
        assert!(read_capped(response, 16).await.is_err());

        let response = client.get(&url).send().await.unwrap();
        assert_eq!(read_capped(response, 1024).await.unwrap().len(), 64);
    }

    #[test]
    fn artifact_key_uses_mime_extension() {
        let id = uuid::Uuid::nil();
        assert_eq!(
            artifact_key(id, "video/mp4"),
            format!("artifacts/{id}.mp4")
        );
        assert_eq!(
            artifact_key(id, "application/x-unknown"),
            format!("artifacts/{id}.bin")
        );
    }
}
