//! 传输会话记录及其存储。
//!
//! 跨请求的保证（取件码唯一、状态转换）全部由 [`SessionStore`] 实现负责，
//! 处理器只使用下列原子操作。

mod memory;
mod sqlite;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

use crate::code::PickupCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending,
    Available,
    /// 已超过 `expires_at` 但尚未被清理的会话。
    /// 不会持久化。
    Expired,
    Deleted,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Available => "available",
            SessionStatus::Expired => "expired",
            SessionStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "available" => Some(SessionStatus::Available),
            "expired" => Some(SessionStatus::Expired),
            "deleted" => Some(SessionStatus::Deleted),
            _ => None,
        }
    }

    /// 会话状态机的合法转换；`Deleted` 为终态。
    pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
        matches!(
            (from, to),
            (SessionStatus::Pending, SessionStatus::Available)
                | (SessionStatus::Pending, SessionStatus::Deleted)
                | (SessionStatus::Available, SessionStatus::Deleted)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferSession {
    pub code: PickupCode,
    pub object_key: String,
    pub original_filename: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl TransferSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 在 `now` 时刻观察到的状态，超过 TTL 视为 `Expired`。
    pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
        if self.status != SessionStatus::Deleted && self.is_expired_at(now) {
            SessionStatus::Expired
        } else {
            self.status
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt session record: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// 取件码到会话元数据的持久映射。
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 取件码未被未删除会话占用时插入 `session`；
    /// 冲突时不做修改并返回 `false`。
    async fn create_if_absent(&self, session: &TransferSession) -> Result<bool, StoreError>;

    /// 查找 `code` 的有效会话。到达 `expires_at` 的会话无论是否已回收，
    /// 都视为不存在。
    async fn get(
        &self,
        code: &PickupCode,
        now: DateTime<Utc>,
    ) -> Result<Option<TransferSession>, StoreError>;

    /// 按 `code` 与 `object_key` 定位会话，对其状态做比较并设置。
    async fn transition_status(
        &self,
        code: &PickupCode,
        object_key: &str,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, StoreError>;

    /// `expires_at <= now` 的未删除会话，按到期时间升序。
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError>;

    /// `expires_at <= now` 的已删除会话，可被物理清除。
    async fn list_retired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError>;

    /// 物理删除一条已删除记录。
    async fn purge(&self, object_key: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn state_machine_edges() {
        use SessionStatus::*;
        assert!(SessionStatus::can_transition(Pending, Available));
        assert!(SessionStatus::can_transition(Pending, Deleted));
        assert!(SessionStatus::can_transition(Available, Deleted));
        assert!(!SessionStatus::can_transition(Available, Pending));
        assert!(!SessionStatus::can_transition(Deleted, Available));
        assert!(!SessionStatus::can_transition(Deleted, Deleted));
        assert!(!SessionStatus::can_transition(Pending, Expired));
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Available,
            SessionStatus::Expired,
            SessionStatus::Deleted,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("gone"), None);
    }

    #[test]
    fn effective_status_reports_expired() {
        let now = Utc::now();
        let record = conformance::session("K3QX", "k/f", now);
        assert_eq!(record.effective_status(now), SessionStatus::Pending);
        assert_eq!(
            record.effective_status(now + Duration::hours(24)),
            SessionStatus::Expired
        );
    }
}
