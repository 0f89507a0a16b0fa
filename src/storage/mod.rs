//! 存储网关：在对象存储之上签发预签名传输 URL。
//!
//! 文件内容从不经过传输服务。网关只签发客户端直接使用的限时 URL，
//! 并为清理任务提供存在性检查与删除。

mod atomic;
mod etag;
#[cfg(test)]
pub(crate) mod fake;
pub mod local;
pub mod objects;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3;
pub mod signer;

pub use local::LocalObjectStore;
pub use retry::{RetryPolicy, RetryingGateway};

use async_trait::async_trait;
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 512;
/// 为 `.json` 元数据后缀预留空间，保证不超过 255 字节的文件名限制。
const MAX_KEY_FILENAME_BYTES: usize = 200;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("object already exists: {0}")]
    AlreadyExists(String),
    #[error("object exceeds {0} bytes")]
    TooLarge(u64),
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// 重试同一调用是否可能成功。
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_) | StorageError::Io(_))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// 传输服务与清理任务使用的对象存储适配器。
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// 允许以 `content_type` 对 `object_key` 执行一次 PUT 的预签名 URL。
    async fn issue_upload_url(
        &self,
        object_key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    /// 允许 GET `object_key` 的预签名 URL。
    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String>;

    async fn exists(&self, object_key: &str) -> StorageResult<bool>;

    /// 删除对象；对象已不存在时也视为成功。
    async fn delete(&self, object_key: &str) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<G: StorageGateway + ?Sized> StorageGateway for Arc<G> {
    async fn issue_upload_url(
        &self,
        object_key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        (**self)
            .issue_upload_url(object_key, content_type, expires_in)
            .await
    }

    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        (**self).issue_download_url(object_key, expires_in).await
    }

    async fn exists(&self, object_key: &str) -> StorageResult<bool> {
        (**self).exists(object_key).await
    }

    async fn delete(&self, object_key: &str) -> StorageResult<()> {
        (**self).delete(object_key).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// 生成形如 `{uuid}/{filename}` 的新对象键。
pub fn new_object_key(filename: &str) -> String {
    format!("{}/{}", Uuid::new_v4().simple(), sanitize_filename(filename))
}

/// 将客户端提供的文件名处理为可安全用作键末段的形式。
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    let mut trimmed = replaced.as_str();
    loop {
        let next = trimmed.trim_start_matches('.').trim();
        if next == trimmed {
            break;
        }
        trimmed = next;
    }
    let mut end = trimmed.len().min(MAX_KEY_FILENAME_BYTES);
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    let truncated = trimmed[..end].trim_end();
    if truncated.is_empty() {
        "file".to_string()
    } else {
        truncated.to_string()
    }
}

/// 拒绝可能逃逸存储根目录或干扰 URL 路由的键。
pub fn validate_object_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key.starts_with('/') || key.contains('\\') || key.chars().any(char::is_control) {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => continue,
            Component::CurDir
            | Component::ParentDir
            | Component::RootDir
            | Component::Prefix(_) => return Err(StorageError::InvalidKey(key.to_string())),
        }
    }
    if key.split('/').any(|segment| segment.is_empty() || segment == ".") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// 对键的每一段做百分号编码，用于 URL 路径。
pub fn encode_key_path(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// 展示给下载者的文件名：键的最后一段。
pub fn key_filename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
