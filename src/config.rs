//! 命令行参数、默认值与启动校验。

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;
use std::time::Duration;
use thiserror::Error;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_PORT: u16 = 8788;
pub const DEFAULT_CODE_ALPHABET: &str = "23456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub const DEFAULT_CODE_LENGTH: usize = 4;
pub const MAX_CODE_LENGTH: usize = 16;
pub const DEFAULT_MAX_ALLOCATION_ATTEMPTS: u32 = 10;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_URL_TTL_SECS: u64 = 15 * 60;
pub const DEFAULT_DOWNLOAD_URL_TTL_SECS: u64 = 5 * 60;
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 2 * 1024 * 1024 * 1024;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_REAP_BATCH_SIZE: u32 = 100;
pub const DEFAULT_STORAGE_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORAGE_RETRY_BASE_MS: u64 = 100;
pub const MAX_FILENAME_LEN: usize = 255;
pub const OBJECT_ROUTE_PREFIX: &str = "/objects";
pub const EXHAUSTED_RETRY_AFTER_SECS: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    Local,
    S3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// 服务的命令行参数与环境变量配置。
#[derive(Parser, Debug, Clone)]
#[command(name = "file-shuttle", version = VERSION_INFO, about = "Ephemeral file drop with pickup codes")]
pub struct Args {
    #[arg(
        short = 'b',
        long,
        env = "SHUTTLE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SHUTTLE_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "SHUTTLE_PUBLIC_URL",
        help = "Externally reachable base URL used in presigned links"
    )]
    pub public_url: Option<String>,
    #[arg(
        long,
        env = "SHUTTLE_STORAGE_BACKEND",
        value_enum,
        default_value_t = StorageBackend::Local,
        help = "Object store backend"
    )]
    pub storage_backend: StorageBackend,
    #[arg(
        short = 's',
        long,
        env = "SHUTTLE_STORAGE_DIR",
        default_value = ".shuttle/objects",
        help = "Object directory for the local backend"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "SHUTTLE_SIGNING_SECRET",
        hide_env_values = true,
        help = "HMAC secret for local presigned URLs (random per process if unset)"
    )]
    pub signing_secret: Option<String>,
    #[arg(long, env = "SHUTTLE_S3_BUCKET", help = "S3 bucket name")]
    pub s3_bucket: Option<String>,
    #[arg(long, env = "SHUTTLE_S3_REGION", default_value = "us-east-1", help = "S3 region")]
    pub s3_region: String,
    #[arg(long, env = "SHUTTLE_S3_ENDPOINT", help = "Custom endpoint for S3-compatible stores")]
    pub s3_endpoint: Option<String>,
    #[arg(
        long,
        env = "SHUTTLE_DATABASE_URL",
        help = "SQLite session store URL, e.g. sqlite://.shuttle/sessions.db (in-memory if unset)"
    )]
    pub database_url: Option<String>,
    #[arg(
        long,
        env = "SHUTTLE_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session lifetime in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "SHUTTLE_UPLOAD_URL_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_URL_TTL_SECS,
        help = "Presigned upload URL lifetime in seconds"
    )]
    pub upload_url_ttl_secs: u64,
    #[arg(
        long,
        env = "SHUTTLE_DOWNLOAD_URL_TTL_SECS",
        default_value_t = DEFAULT_DOWNLOAD_URL_TTL_SECS,
        help = "Presigned download URL lifetime in seconds"
    )]
    pub download_url_ttl_secs: u64,
    #[arg(
        long,
        env = "SHUTTLE_CODE_LENGTH",
        default_value_t = DEFAULT_CODE_LENGTH,
        help = "Pickup code length"
    )]
    pub code_length: usize,
    #[arg(
        long,
        env = "SHUTTLE_CODE_ALPHABET",
        default_value = DEFAULT_CODE_ALPHABET,
        help = "Pickup code alphabet"
    )]
    pub code_alphabet: String,
    #[arg(
        long,
        env = "SHUTTLE_MAX_ALLOCATION_ATTEMPTS",
        default_value_t = DEFAULT_MAX_ALLOCATION_ATTEMPTS,
        help = "Collision retries before giving up on a code"
    )]
    pub max_allocation_attempts: u32,
    #[arg(
        long,
        env = "SHUTTLE_SINGLE_USE",
        help = "Burn a code after its first successful download"
    )]
    pub single_use: bool,
    #[arg(
        long,
        env = "SHUTTLE_OPTIMISTIC_UPLOADS",
        help = "Expose sessions before confirming the object exists"
    )]
    pub optimistic_uploads: bool,
    #[arg(
        long,
        env = "SHUTTLE_MAX_OBJECT_SIZE",
        default_value_t = DEFAULT_MAX_OBJECT_SIZE,
        help = "Max object size in bytes for the local backend (0 to disable)"
    )]
    pub max_object_size: u64,
    #[arg(
        long,
        env = "SHUTTLE_REAP_INTERVAL_SECS",
        default_value_t = DEFAULT_REAP_INTERVAL_SECS,
        help = "Expiry sweep interval in seconds (0 to disable)"
    )]
    pub reap_interval_secs: u64,
    #[arg(
        long,
        env = "SHUTTLE_REAP_BATCH_SIZE",
        default_value_t = DEFAULT_REAP_BATCH_SIZE,
        help = "Sessions fetched per sweep batch"
    )]
    pub reap_batch_size: u32,
    #[arg(
        long,
        env = "SHUTTLE_STORAGE_RETRY_ATTEMPTS",
        default_value_t = DEFAULT_STORAGE_RETRY_ATTEMPTS,
        help = "Attempts for transient object store failures"
    )]
    pub storage_retry_attempts: u32,
    #[arg(
        long,
        env = "SHUTTLE_STORAGE_RETRY_BASE_MS",
        default_value_t = DEFAULT_STORAGE_RETRY_BASE_MS,
        help = "Base backoff between storage retries in milliseconds"
    )]
    pub storage_retry_base_ms: u64,
    #[arg(long, env = "SHUTTLE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SHUTTLE_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        help = "Log output format"
    )]
    pub log_format: LogFormat,
    #[arg(long, help = "Run a single expiry sweep and exit")]
    pub sweep_once: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("code alphabet needs at least two distinct symbols")]
    AlphabetTooSmall,
    #[error("code alphabet contains invalid symbol {0:?}")]
    AlphabetSymbol(char),
    #[error("code alphabet repeats symbol {0:?}")]
    AlphabetDuplicate(char),
    #[error("code length must be between 1 and 16")]
    CodeLength,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("session ttl must not exceed {MAX_SESSION_TTL_SECS} seconds")]
    SessionTtlTooLong,
    #[error("upload url ttl ({upload}s) must not outlive the session ttl ({session}s)")]
    UploadOutlivesSession { upload: u64, session: u64 },
    #[error("public url must start with http:// or https://")]
    PublicUrl,
    #[error("s3 backend requires --s3-bucket")]
    MissingBucket,
}

impl Args {
    /// 预签名链接使用的基础 URL。
    pub fn public_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.port),
        }
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn upload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_url_ttl_secs)
    }

    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }

    /// 拒绝服务无法运行的配置。
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_alphabet(&self.code_alphabet)?;
        if self.code_length == 0 || self.code_length > MAX_CODE_LENGTH {
            return Err(ConfigError::CodeLength);
        }
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::Zero("session ttl"));
        }
        if self.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(ConfigError::SessionTtlTooLong);
        }
        if self.upload_url_ttl_secs == 0 {
            return Err(ConfigError::Zero("upload url ttl"));
        }
        // 清理之后才到达的 PUT 会留下无会话引用的对象。
        if self.upload_url_ttl_secs > self.session_ttl_secs {
            return Err(ConfigError::UploadOutlivesSession {
                upload: self.upload_url_ttl_secs,
                session: self.session_ttl_secs,
            });
        }
        if self.download_url_ttl_secs == 0 {
            return Err(ConfigError::Zero("download url ttl"));
        }
        if self.max_allocation_attempts == 0 {
            return Err(ConfigError::Zero("max allocation attempts"));
        }
        if self.reap_batch_size == 0 {
            return Err(ConfigError::Zero("reap batch size"));
        }
        if self.storage_retry_attempts == 0 {
            return Err(ConfigError::Zero("storage retry attempts"));
        }
        let base = self.public_base_url();
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(ConfigError::PublicUrl);
        }
        if self.storage_backend == StorageBackend::S3 && self.s3_bucket.is_none() {
            return Err(ConfigError::MissingBucket);
        }
        Ok(())
    }
}

fn validate_alphabet(alphabet: &str) -> Result<(), ConfigError> {
    let mut seen = Vec::new();
    for ch in alphabet.chars() {
        if !(ch.is_ascii_uppercase() || ch.is_ascii_digit()) {
            return Err(ConfigError::AlphabetSymbol(ch));
        }
        if seen.contains(&ch) {
            return Err(ConfigError::AlphabetDuplicate(ch));
        }
        seen.push(ch);
    }
    if seen.len() < 2 {
        return Err(ConfigError::AlphabetTooSmall);
    }
    Ok(())
}
