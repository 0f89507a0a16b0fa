//! 供服务与清理测试使用的内存网关。

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{StorageError, StorageGateway, StorageResult, validate_object_key};

#[derive(Debug, Default)]
pub struct FakeGateway {
    objects: Mutex<HashSet<String>>,
    failing: AtomicBool,
    broken_deletes: Mutex<HashSet<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟客户端的直接 PUT。
    pub fn put(&self, object_key: &str) {
        self.objects
            .lock()
            .expect("objects poisoned")
            .insert(object_key.to_string());
    }

    pub fn contains(&self, object_key: &str) -> bool {
        self.objects
            .lock()
            .expect("objects poisoned")
            .contains(object_key)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().expect("objects poisoned").len()
    }

    /// 之后的所有调用都返回后端错误，直到恢复。
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 仅让某个键的删除失败，其余调用正常。
    pub fn break_delete(&self, object_key: &str) {
        self.broken_deletes
            .lock()
            .expect("broken deletes poisoned")
            .insert(object_key.to_string());
    }

    fn check(&self, object_key: &str) -> StorageResult<()> {
        validate_object_key(object_key)?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageGateway for FakeGateway {
    async fn issue_upload_url(
        &self,
        object_key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.check(object_key)?;
        Ok(format!(
            "https://store.test/{object_key}?op=put&type={}&ttl={}",
            urlencoding::encode(content_type),
            expires_in.as_secs()
        ))
    }

    async fn issue_download_url(
        &self,
        object_key: &str,
        expires_in: Duration,
    ) -> StorageResult<String> {
        self.check(object_key)?;
        Ok(format!(
            "https://store.test/{object_key}?op=get&ttl={}",
            expires_in.as_secs()
        ))
    }

    async fn exists(&self, object_key: &str) -> StorageResult<bool> {
        self.check(object_key)?;
        Ok(self.contains(object_key))
    }

    async fn delete(&self, object_key: &str) -> StorageResult<()> {
        self.check(object_key)?;
        if self
            .broken_deletes
            .lock()
            .expect("broken deletes poisoned")
            .contains(object_key)
        {
            return Err(StorageError::Backend(format!("delete of {object_key} refused")));
        }
        self.objects
            .lock()
            .expect("objects poisoned")
            .remove(object_key);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}
