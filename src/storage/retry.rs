//! 为任意 [`StorageGateway`] 提供指数退避重试。

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::{StorageGateway, StorageResult};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// 总尝试次数，包括首次调用。
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 第 `attempt` 次重试（从 1 开始）前的等待时间：base、2 倍、4 倍……
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor)
    }
}

/// 重试暂时性的网关错误，其他错误直接返回。
pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: StorageGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        object_key: &str,
        call: F,
    ) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        operation,
                        key = object_key,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "storage call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl<G: StorageGateway> StorageGateway for RetryingGateway<G> {
    async fn issue_upload_url(
        &self,
        object_key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.run("issue_upload_url", object_key, move || {
            self.inner
                .issue_upload_url(object_key, content_type, expires_in)
        })
        .await
    }

    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.run("issue_download_url", object_key, move || {
            self.inner.issue_download_url(object_key, expires_in)
        })
        .await
    }

    async fn exists(&self, object_key: &str) -> StorageResult<bool> {
        self.run("exists", object_key, move || self.inner.exists(object_key))
            .await
    }

    async fn delete(&self, object_key: &str) -> StorageResult<()> {
        self.run("delete", object_key, move || self.inner.delete(object_key))
            .await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }
}
