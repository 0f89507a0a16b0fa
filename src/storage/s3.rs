//! 基于 `object_store` 的 S3 兼容网关。

use async_trait::async_trait;
use http::Method;
use object_store::Error as ObjectStoreError;
use object_store::ObjectStoreExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use std::time::Duration;
use tracing::{debug, info};

use super::{StorageError, StorageGateway, StorageResult, validate_object_key};

pub struct S3Gateway {
    store: AmazonS3,
    bucket: String,
}

impl S3Gateway {
    /// 凭据来自常规的 `AWS_*` 环境变量。
    pub fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket);
        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        let store = builder
            .build()
            .map_err(|err| StorageError::Config(err.to_string()))?;
        info!(bucket, region, endpoint, "s3 gateway ready");
        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    fn location(object_key: &str) -> StorageResult<Path> {
        validate_object_key(object_key)?;
        Ok(Path::from(object_key))
    }

    async fn presign(
        &self,
        method: Method,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        let location = Self::location(object_key)?;
        let url = self
            .store
            .signed_url(method, &location, expires_in)
            .await
            .map_err(backend_error)?;
        Ok(url.to_string())
    }
}

fn backend_error(err: ObjectStoreError) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[async_trait]
impl StorageGateway for S3Gateway {
    // S3 预签名 PUT 不绑定内容类型，内容类型由会话记录。
    async fn issue_upload_url(
        &self,
        object_key: &str,
        _content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.presign(Method::PUT, object_key, expires_in).await
    }

    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.presign(Method::GET, object_key, expires_in).await
    }

    async fn exists(&self, object_key: &str) -> StorageResult<bool> {
        let location = Self::location(object_key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(backend_error(err)),
        }
    }

    async fn delete(&self, object_key: &str) -> StorageResult<()> {
        let location = Self::location(object_key)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {
                debug!(bucket = %self.bucket, key = object_key, "object deleted");
                Ok(())
            }
            Err(err) => Err(backend_error(err)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}
