use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{SessionStatus, SessionStore, StoreError, TransferSession};
use crate::code::PickupCode;

/// 进程内存储，用于开发与测试，不跨进程共享。
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    active: HashMap<PickupCode, TransferSession>,
    retired: HashMap<String, TransferSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn oldest_first(mut sessions: Vec<TransferSession>, limit: u32) -> Vec<TransferSession> {
    sessions.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
    sessions.truncate(limit as usize);
    sessions
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_if_absent(&self, session: &TransferSession) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.active.contains_key(&session.code) {
            return Ok(false);
        }
        inner.active.insert(session.code.clone(), session.clone());
        Ok(true)
    }

    async fn get(
        &self,
        code: &PickupCode,
        now: DateTime<Utc>,
    ) -> Result<Option<TransferSession>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .active
            .get(code)
            .filter(|session| !session.is_expired_at(now))
            .cloned())
    }

    async fn transition_status(
        &self,
        code: &PickupCode,
        object_key: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, StoreError> {
        if !SessionStatus::can_transition(from, to) {
            return Ok(false);
        }
        let mut inner = self.inner.lock().await;
        let Some(session) = inner.active.get_mut(code) else {
            return Ok(false);
        };
        if session.object_key != object_key || session.status != from {
            return Ok(false);
        }
        session.status = to;
        if to == SessionStatus::Deleted
            && let Some(session) = inner.active.remove(code)
        {
            inner.retired.insert(session.object_key.clone(), session);
        }
        Ok(true)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError> {
        let inner = self.inner.lock().await;
        let expired = inner
            .active
            .values()
            .filter(|session| session.is_expired_at(now))
            .cloned()
            .collect();
        Ok(oldest_first(expired, limit))
    }

    async fn list_retired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError> {
        let inner = self.inner.lock().await;
        let retired = inner
            .retired
            .values()
            .filter(|session| session.is_expired_at(now))
            .cloned()
            .collect();
        Ok(oldest_first(retired, limit))
    }

    async fn purge(&self, object_key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.retired.remove(object_key).is_some())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
