//! 基于 SQLite 的会话存储。
//!
//! 活跃取件码的唯一性由未删除行上的部分唯一索引保证，并发插入在 SQLite 内竞争。
//! 状态变更是按对象键限定的条件 `UPDATE`。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{SessionStatus, SessionStore, StoreError, TransferSession};
use crate::code::PickupCode;

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS transfer_sessions (
        object_key TEXT PRIMARY KEY NOT NULL,
        code TEXT NOT NULL,
        original_filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        status TEXT NOT NULL
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS transfer_sessions_active_code
        ON transfer_sessions (code) WHERE status <> 'deleted'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS transfer_sessions_expires_at
        ON transfer_sessions (expires_at)
    "#,
];

const SELECT_COLUMNS: &str =
    "code, object_key, original_filename, content_type, created_at, expires_at, status";

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// 打开（必要时创建）`url` 指向的数据库并应用表结构。
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.apply_schema().await?;
        info!(url, "sqlite session store ready");
        Ok(store)
    }

    async fn apply_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn fetch_by_status(
        &self,
        retired: bool,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError> {
        let status_clause = if retired {
            "status = 'deleted'"
        } else {
            "status <> 'deleted'"
        };
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM transfer_sessions \
             WHERE {status_clause} AND expires_at <= ? \
             ORDER BY expires_at ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(now.timestamp_millis())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }
}

fn timestamp_from_millis(value: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {value}")))
}

fn session_from_row(row: &SqliteRow) -> Result<TransferSession, StoreError> {
    let status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status:?}")))?;
    Ok(TransferSession {
        code: PickupCode::from_canonical(row.try_get("code")?),
        object_key: row.try_get("object_key")?,
        original_filename: row.try_get("original_filename")?,
        content_type: row.try_get("content_type")?,
        created_at: timestamp_from_millis(row.try_get("created_at")?)?,
        expires_at: timestamp_from_millis(row.try_get("expires_at")?)?,
        status,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_if_absent(&self, session: &TransferSession) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO transfer_sessions
                (object_key, code, original_filename, content_type, created_at, expires_at, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.object_key)
        .bind(session.code.as_str())
        .bind(&session.original_filename)
        .bind(&session.content_type)
        .bind(session.created_at.timestamp_millis())
        .bind(session.expires_at.timestamp_millis())
        .bind(session.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation()
                    && db_err.message().contains("transfer_sessions.code") =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get(
        &self,
        code: &PickupCode,
        now: DateTime<Utc>,
    ) -> Result<Option<TransferSession>, StoreError> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM transfer_sessions \
             WHERE code = ? AND status <> 'deleted' AND expires_at > ?"
        );
        let row = sqlx::query(&sql)
            .bind(code.as_str())
            .bind(now.timestamp_millis())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
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
        let result = sqlx::query(
            "UPDATE transfer_sessions SET status = ? WHERE object_key = ? AND code = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(object_key)
        .bind(code.as_str())
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError> {
        self.fetch_by_status(false, now, limit).await
    }

    async fn list_retired(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TransferSession>, StoreError> {
        self.fetch_by_status(true, now, limit).await
    }

    async fn purge(&self, object_key: &str) -> Result<bool, StoreError> {
        let result =
            sqlx::query("DELETE FROM transfer_sessions WHERE object_key = ? AND status = 'deleted'")
                .bind(object_key)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
