use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Image,
    Video,
    Audio,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(ContentType::Image),
            "video" => Some(ContentType::Video),
            "audio" => Some(ContentType::Audio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "processing" => Some(JobState::Processing),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Subscription tier; unknown tier strings degrade to Free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Free,
    Plus,
    Pro,
}

impl Tier {
    pub fn parse(s: &str) -> Self {
        match s {
            "plus" => Tier::Plus,
            "pro" => Tier::Pro,
            _ => Tier::Free,
        }
    }

    pub fn hourly_cap(&self) -> i64 {
        match self {
            Tier::Free => 10,
            Tier::Plus => 60,
            Tier::Pro => 240,
        }
    }

    pub fn concurrent_cap(&self) -> i64 {
        match self {
            Tier::Free => 2,
            Tier::Plus => 5,
            Tier::Pro => 12,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub account_id: Uuid,
    pub provider: String,
    pub content_type: String,
    pub status: String,
    pub provider_task_id: Option<String>,
    pub credits_reserved: f64,
    pub callback_token: String,
    pub output_url: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn state(&self) -> JobState {
        JobState::parse(&self.status).unwrap_or(JobState::Pending)
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub provider: String,
    pub content_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Set when resubmitting a failed job; excluded from the concurrency cap.
    #[serde(default)]
    pub retry_of: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub status: JobState,
    pub credits_charged: f64,
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub provider: String,
    pub content_type: String,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub credits_reserved: f64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let status = job.state();
        JobView {
            job_id: job.id,
            provider: job.provider,
            content_type: job.content_type,
            status,
            output_url: job.output_url,
            error_code: job.error_code,
            credits_reserved: job.credits_reserved,
            created_at: job.created_at,
            finalized_at: job.finalized_at,
        }
    }
}
