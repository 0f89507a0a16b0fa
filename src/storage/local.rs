//! 本地文件对象存储，预签名 URL 指回本服务。
//!
//! 根目录布局：`data/{key}` 存放对象内容，
//! `meta/{key}.json` 记录上传时的内容类型。

use async_trait::async_trait;
use axum::Error as AxumError;
use axum::body::Body as AxumBody;
use chrono::Utc;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::atomic::AtomicFile;
use super::signer::{SignatureError, UrlSigner};
use super::{
    StorageError, StorageGateway, StorageResult, encode_key_path, key_filename,
    validate_object_key,
};
use crate::config::OBJECT_ROUTE_PREFIX;

const DATA_DIR: &str = "data";
const META_DIR: &str = "meta";

/// 本地预签名 URL 携带的查询参数。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedQuery {
    pub expires: i64,
    pub content_type: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub content_type: String,
    pub size: u64,
}

/// 已打开待读取的对象。
pub struct StoredObject {
    pub file: File,
    pub metadata: Metadata,
    pub content_type: String,
    pub filename: String,
}

#[derive(Debug)]
pub struct LocalObjectStore {
    root: PathBuf,
    base_url: String,
    signer: UrlSigner,
    max_object_size: u64,
}

impl LocalObjectStore {
    /// `max_object_size` 为 0 时不限制大小。
    pub fn new(root: PathBuf, base_url: &str, signer: UrlSigner, max_object_size: u64) -> Self {
        Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
            max_object_size,
        }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.join(DATA_DIR)).await?;
        fs::create_dir_all(self.root.join(META_DIR)).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn max_object_size(&self) -> u64 {
        self.max_object_size
    }

    async fn data_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_object_key(key)?;
        let base = self.root.join(DATA_DIR);
        let target = base.join(key);
        ensure_no_symlink_components(&base, &target).await?;
        Ok(target)
    }

    fn meta_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_object_key(key)?;
        Ok(self.root.join(META_DIR).join(format!("{key}.json")))
    }

    fn presign(
        &self,
        method: &str,
        key: &str,
        content_type: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String> {
        validate_object_key(key)?;
        let expires_in = i64::try_from(expires_in.as_secs())
            .map_err(|_| StorageError::Config("url lifetime too large".into()))?;
        let expires = Utc::now().timestamp().saturating_add(expires_in);
        let signature = self.signer.sign(method, key, expires, content_type);
        let mut url = format!(
            "{}{}/{}?expires={}&signature={}",
            self.base_url,
            OBJECT_ROUTE_PREFIX,
            encode_key_path(key),
            expires,
            signature
        );
        if let Some(content_type) = content_type {
            url.push_str("&contentType=");
            url.push_str(&urlencoding::encode(content_type));
        }
        Ok(url)
    }

    /// 校验预签名请求的签名与过期时间。
    pub fn authorize(
        &self,
        method: &str,
        key: &str,
        query: &PresignedQuery,
    ) -> Result<(), SignatureError> {
        self.signer.verify(
            method,
            key,
            query.expires,
            query.content_type.as_deref(),
            &query.signature,
            Utc::now().timestamp(),
        )
    }

    /// 将 `body` 流式写入新对象，已存在的对象不会被替换。
    pub async fn write_object(
        &self,
        key: &str,
        content_type: &str,
        body: AxumBody,
    ) -> StorageResult<u64> {
        let target = self.data_path(key).await?;
        let meta_path = self.meta_path(key)?;
        if fs::try_exists(&target).await? {
            return Err(StorageError::AlreadyExists(key.to_string()));
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let mut data_stream = BodyExt::into_data_stream(body);
        let mut total_written: u64 = 0;
        while let Some(chunk) = data_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let err: AxumError = err;
                    atomic.cleanup().await;
                    return Err(StorageError::Io(io::Error::other(err.to_string())));
                }
            };
            if chunk.is_empty() {
                continue;
            }
            total_written += chunk.len() as u64;
            if self.max_object_size > 0 && total_written > self.max_object_size {
                atomic.cleanup().await;
                return Err(StorageError::TooLarge(self.max_object_size));
            }
            if let Err(err) = atomic.file_mut().write_all(&chunk).await {
                atomic.cleanup().await;
                return Err(err.into());
            }
        }

        match atomic.finalize_new().await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        }

        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            size: total_written,
        };
        let meta_bytes =
            serde_json::to_vec(&meta).map_err(|err| StorageError::Backend(err.to_string()))?;
        if let Some(parent) = meta_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&meta_path, meta_bytes).await?;

        info!(key, bytes = total_written, "object stored");
        Ok(total_written)
    }

    /// 打开对象以流式返回给客户端。
    pub async fn open_object(&self, key: &str) -> StorageResult<StoredObject> {
        let target = self.data_path(key).await?;
        let file = match File::open(&target).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let metadata = file.metadata().await?;
        let filename = key_filename(key).to_string();
        let content_type = match self.read_meta(key).await {
            Some(meta) => meta.content_type,
            None => mime_guess::from_path(&filename)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };
        Ok(StoredObject {
            file,
            metadata,
            content_type,
            filename,
        })
    }

    async fn read_meta(&self, key: &str) -> Option<ObjectMeta> {
        let path = self.meta_path(key).ok()?;
        let bytes = fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

async fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// 删除 `path` 与 `stop` 之间已变为空的目录。
async fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}

async fn ensure_no_symlink_components(base: &Path, target: &Path) -> StorageResult<()> {
    let relative = target
        .strip_prefix(base)
        .map_err(|_| StorageError::InvalidKey(target.display().to_string()))?;
    let mut current = base.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::InvalidKey(relative.display().to_string()));
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::InvalidKey(relative.display().to_string()));
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

#[async_trait]
impl StorageGateway for LocalObjectStore {
    async fn issue_upload_url(
        &self,
        object_key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.presign("PUT", object_key, Some(content_type), expires_in)
    }

    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.presign("GET", object_key, None, expires_in)
    }

    async fn exists(&self, object_key: &str) -> StorageResult<bool> {
        let target = self.data_path(object_key).await?;
        Ok(fs::try_exists(&target).await?)
    }

    async fn delete(&self, object_key: &str) -> StorageResult<()> {
        let target = self.data_path(object_key).await?;
        let meta_path = self.meta_path(object_key)?;
        remove_if_present(&target).await?;
        remove_if_present(&meta_path).await?;
        prune_empty_parents(&target, &self.root.join(DATA_DIR)).await;
        prune_empty_parents(&meta_path, &self.root.join(META_DIR)).await;
        debug!(key = object_key, "object deleted");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}
