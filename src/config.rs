use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "mediaforge")]
#[command(about = "AI media generation API server", long_about = None)]
pub struct Config {
    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "SERVER_PORT", default_value = "8080")]
    pub port: u16,

    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/mediaforge")]
    pub database_url: String,

    #[arg(long, env = "CORS_ORIGINS", default_value = "")]
    pub cors_origins: String,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout: u64,

    /// Base URL providers call back on, e.g. https://api.example.com
    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    // credit pricing (per generation, before provider multiplier)
    #[arg(long, env = "COST_IMAGE", default_value = "0.5")]
    pub cost_image: f64,

    #[arg(long, env = "COST_VIDEO", default_value = "2.0")]
    pub cost_video: f64,

    #[arg(long, env = "COST_AUDIO", default_value = "0.25")]
    pub cost_audio: f64,

    // provider dispatch
    #[arg(long, env = "DISPATCH_TIMEOUT_SECS", default_value = "60")]
    pub dispatch_timeout: u64,

    #[arg(long, env = "DEEPINFRA_TOKEN")]
    pub deepinfra_token: Option<String>,

    #[arg(long, env = "DEEPINFRA_BASE_URL", default_value = "https://api.deepinfra.com")]
    pub deepinfra_base_url: String,

    #[arg(long, env = "REPLICATE_TOKEN")]
    pub replicate_token: Option<String>,

    #[arg(long, env = "REPLICATE_BASE_URL", default_value = "https://api.replicate.com")]
    pub replicate_base_url: String,

    #[arg(long, env = "REPLICATE_WEBHOOK_SECRET")]
    pub replicate_webhook_secret: Option<String>,

    // circuit breaker
    #[arg(long, env = "BREAKER_THRESHOLD", default_value = "5")]
    pub breaker_threshold: u32,

    #[arg(long, env = "BREAKER_COOLDOWN_SECS", default_value = "60")]
    pub breaker_cooldown_secs: u64,

    // webhook ingestion
    #[arg(long, env = "WEBHOOK_TOLERANCE_SECS", default_value = "300")]
    pub webhook_tolerance_secs: i64,

    // recovery scanner
    #[arg(long, env = "RECOVERY_INTERVAL_SECS", default_value = "120")]
    pub recovery_interval_secs: u64,

    #[arg(long, env = "RECOVERY_GRACE_SECS", default_value = "300")]
    pub recovery_grace_secs: i64,

    #[arg(long, env = "RECOVERY_BATCH_SIZE", default_value = "25")]
    pub recovery_batch_size: i64,

    // artifact store (minio / s3)
    #[arg(long, env = "MINIO_ENDPOINT", default_value = "http://localhost:9000")]
    pub minio_endpoint: String,

    #[arg(long, env = "MINIO_ACCESS_KEY", default_value = "minioadmin")]
    pub minio_access_key: String,

    #[arg(long, env = "MINIO_SECRET_KEY", default_value = "minioadmin")]
    pub minio_secret_key: String,

    #[arg(long, env = "S3_BUCKET", default_value = "mediaforge-artifacts")]
    pub s3_bucket: String,

    #[arg(long, env = "MEDIA_PUBLIC_URL", default_value = "http://localhost:9000/mediaforge-artifacts")]
    pub media_public_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::parse()
    }

    pub fn base_cost(&self, content_type: crate::models::ContentType) -> f64 {
        match content_type {
            crate::models::ContentType::Image => self.cost_image,
            crate::models::ContentType::Video => self.cost_video,
            crate::models::ContentType::Audio => self.cost_audio,
        }
    }
}
