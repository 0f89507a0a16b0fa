//! 两个传输操作：开始上传、兑换取件码。
//!
//! 服务不持有记录也不持有文件内容：它校验输入，向网关申请预签名 URL，
//! 并只通过存储的比较并设置操作推进会话状态。

use chrono::{DateTime, Utc};
use mime_guess::mime::Mime;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::allocator::{AllocationError, CodeAllocator};
use crate::clock::Clock;
use crate::code::PickupCode;
use crate::config::MAX_FILENAME_LEN;
use crate::session::{SessionStatus, SessionStore, StoreError, TransferSession};
use crate::storage::{StorageError, StorageGateway, new_object_key};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("{0}")]
    Validation(String),
    #[error("no free pickup code after {attempts} attempts")]
    CodeSpaceExhausted { attempts: u32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid or expired code")]
    InvalidOrExpiredCode,
    #[error(transparent)]
    SessionStore(#[from] StoreError),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

impl From<AllocationError> for TransferError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::Exhausted { attempts } => TransferError::CodeSpaceExhausted { attempts },
            AllocationError::Store(err) => TransferError::SessionStore(err),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransferPolicy {
    pub session_ttl: Duration,
    pub upload_url_ttl: Duration,
    pub download_url_ttl: Duration,
    /// 签发下载 URL 后即作废取件码。
    pub single_use: bool,
    /// 要求对象存在后才提供待确认的会话。
    pub confirm_uploads: bool,
}

#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub code: PickupCode,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadTicket {
    pub download_url: String,
    pub filename: String,
    pub content_type: String,
}

pub struct TransferService {
    store: Arc<dyn SessionStore>,
    gateway: Arc<dyn StorageGateway>,
    allocator: CodeAllocator,
    clock: Arc<dyn Clock>,
    policy: TransferPolicy,
}

impl TransferService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gateway: Arc<dyn StorageGateway>,
        allocator: CodeAllocator,
        clock: Arc<dyn Clock>,
        policy: TransferPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            allocator,
            clock,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// 创建会话，返回取件码与预签名上传 URL。
    pub async fn init_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadTicket, TransferError> {
        let filename = validate_filename(filename)?;
        let content_type = validate_content_type(content_type)?;

        let created_at = self.clock.now();
        let expires_at = chrono::Duration::from_std(self.policy.session_ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or_else(|| TransferError::Misconfigured("session ttl out of range".into()))?;

        // 先签发 URL，网关失败时不会留下会话；
        // URL 有效期不超过会话，避免迟到的 PUT 留下孤立对象。
        let object_key = new_object_key(filename);
        let upload_ttl = self.policy.upload_url_ttl.min(self.policy.session_ttl);
        let upload_url = self
            .gateway
            .issue_upload_url(&object_key, content_type, upload_ttl)
            .await?;
        let status = if self.policy.confirm_uploads {
            SessionStatus::Pending
        } else {
            SessionStatus::Available
        };

        let session = self
            .allocator
            .reserve(self.store.as_ref(), |code| TransferSession {
                code,
                object_key: object_key.clone(),
                original_filename: filename.to_string(),
                content_type: content_type.to_string(),
                created_at,
                expires_at,
                status,
            })
            .await?;

        info!(
            code = %session.code,
            key = %session.object_key,
            content_type,
            %expires_at,
            "upload session created"
        );
        Ok(UploadTicket {
            code: session.code,
            upload_url,
            expires_at,
        })
    }

    /// 将取件码解析为预签名下载 URL。
    pub async fn get_download(&self, raw_code: &str) -> Result<DownloadTicket, TransferError> {
        let code = self
            .allocator
            .format()
            .parse(raw_code)
            .ok_or(TransferError::InvalidOrExpiredCode)?;
        let now = self.clock.now();
        let session = self
            .store
            .get(&code, now)
            .await?
            .ok_or(TransferError::InvalidOrExpiredCode)?;

        match session.effective_status(now) {
            SessionStatus::Available => {}
            SessionStatus::Pending => self.confirm_upload(&session, now).await?,
            SessionStatus::Expired | SessionStatus::Deleted => {
                return Err(TransferError::InvalidOrExpiredCode);
            }
        }

        let download_url = self
            .gateway
            .issue_download_url(&session.object_key, self.policy.download_url_ttl)
            .await?;

        if self.policy.single_use {
            let consumed = self
                .store
                .transition_status(
                    &code,
                    &session.object_key,
                    SessionStatus::Available,
                    SessionStatus::Deleted,
                )
                .await?;
            if !consumed {
                debug!(code = %code, "single-use code already consumed");
                return Err(TransferError::InvalidOrExpiredCode);
            }
        }

        info!(
            code = %code,
            key = %session.object_key,
            single_use = self.policy.single_use,
            "download url issued"
        );
        Ok(DownloadTicket {
            download_url,
            filename: session.original_filename,
            content_type: session.content_type,
        })
    }

    /// 对象存在后把待确认会话转为可用。
    async fn confirm_upload(
        &self,
        session: &TransferSession,
        now: DateTime<Utc>,
    ) -> Result<(), TransferError> {
        if !self.gateway.exists(&session.object_key).await? {
            debug!(code = %session.code, "object not uploaded yet");
            return Err(TransferError::InvalidOrExpiredCode);
        }
        let confirmed = self
            .store
            .transition_status(
                &session.code,
                &session.object_key,
                SessionStatus::Pending,
                SessionStatus::Available,
            )
            .await?;
        if confirmed {
            debug!(code = %session.code, "upload confirmed");
            return Ok(());
        }
        // 竞争失败：若其他请求已确认则无妨，若已被回收则不可用。
        match self.store.get(&session.code, now).await? {
            Some(current)
                if current.object_key == session.object_key
                    && current.status == SessionStatus::Available =>
            {
                Ok(())
            }
            _ => Err(TransferError::InvalidOrExpiredCode),
        }
    }
}

fn validate_filename(raw: &str) -> Result<&str, TransferError> {
    let filename = raw.trim();
    if filename.is_empty() {
        return Err(TransferError::Validation("filename is required".into()));
    }
    if filename.chars().count() > MAX_FILENAME_LEN {
        return Err(TransferError::Validation(format!(
            "filename exceeds {MAX_FILENAME_LEN} characters"
        )));
    }
    Ok(filename)
}

fn validate_content_type(raw: &str) -> Result<&str, TransferError> {
    let content_type = raw.trim();
    if content_type.is_empty() {
        return Err(TransferError::Validation("contentType is required".into()));
    }
    content_type
        .parse::<Mime>()
        .map_err(|_| TransferError::Validation(format!("invalid contentType: {content_type}")))?;
    Ok(content_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::code::CodeFormat;
    use crate::config::{DEFAULT_CODE_ALPHABET, DEFAULT_CODE_LENGTH};
    use crate::session::MemorySessionStore;
    use crate::storage::fake::FakeGateway;
    use std::collections::HashSet;

    struct Harness {
        service: Arc<TransferService>,
        store: Arc<MemorySessionStore>,
        gateway: Arc<FakeGateway>,
    }

    fn policy() -> TransferPolicy {
        TransferPolicy {
            session_ttl: Duration::from_secs(24 * 60 * 60),
            upload_url_ttl: Duration::from_secs(900),
            download_url_ttl: Duration::from_secs(300),
            single_use: false,
            confirm_uploads: true,
        }
    }

    fn harness_with(policy: TransferPolicy, clock: Arc<dyn Clock>) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let allocator = CodeAllocator::new(
            CodeFormat::new(DEFAULT_CODE_ALPHABET, DEFAULT_CODE_LENGTH),
            10,
        );
        let service = Arc::new(TransferService::new(
            store.clone(),
            gateway.clone(),
            allocator,
            clock,
            policy,
        ));
        Harness {
            service,
            store,
            gateway,
        }
    }

    fn harness() -> Harness {
        harness_with(policy(), Arc::new(SystemClock))
    }

    async fn upload(h: &Harness, filename: &str) -> UploadTicket {
        let ticket = h
            .service
            .init_upload(filename, "application/pdf")
            .await
            .expect("init upload");
        let session = h
            .store
            .get(&ticket.code, Utc::now())
            .await
            .expect("store")
            .expect("session");
        h.gateway.put(&session.object_key);
        ticket
    }

    #[tokio::test]
    async fn upload_then_download_with_lowercase_code() {
        let h = harness();
        let ticket = upload(&h, "report.pdf").await;
        assert!(ticket.upload_url.contains("op=put"));
        assert!(ticket.upload_url.contains("/report.pdf?"));

        let lowercase = ticket.code.as_str().to_ascii_lowercase();
        let download = h.service.get_download(&lowercase).await.expect("download");
        assert!(download.download_url.contains("op=get"));
        assert!(download.download_url.contains("/report.pdf?"));
        assert_eq!(download.filename, "report.pdf");
        assert_eq!(download.content_type, "application/pdf");

        let session = h
            .store
            .get(&ticket.code, Utc::now())
            .await
            .expect("store")
            .expect("session");
        assert_eq!(session.status, SessionStatus::Available);

        // 未开启单次取件时取件码可继续使用。
        h.service.get_download(ticket.code.as_str()).await.expect("again");
    }

    #[tokio::test]
    async fn unknown_and_malformed_codes_are_rejected() {
        let h = harness();
        for raw in ["ZZZZ", "", "0000", "ABCDE", "ab!"] {
            assert!(
                matches!(
                    h.service.get_download(raw).await,
                    Err(TransferError::InvalidOrExpiredCode)
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn pending_session_without_object_is_not_served() {
        let h = harness();
        let ticket = h
            .service
            .init_upload("notes.txt", "text/plain")
            .await
            .expect("init");
        assert!(matches!(
            h.service.get_download(ticket.code.as_str()).await,
            Err(TransferError::InvalidOrExpiredCode)
        ));
        let session = h
            .store
            .get(&ticket.code, Utc::now())
            .await
            .expect("store")
            .expect("session");
        assert_eq!(session.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn optimistic_policy_serves_before_upload() {
        let h = harness_with(
            TransferPolicy {
                confirm_uploads: false,
                ..policy()
            },
            Arc::new(SystemClock),
        );
        let ticket = h
            .service
            .init_upload("notes.txt", "text/plain")
            .await
            .expect("init");
        h.service
            .get_download(ticket.code.as_str())
            .await
            .expect("served without confirmation");
        assert_eq!(h.gateway.len(), 0);
    }

    #[tokio::test]
    async fn single_use_code_cannot_be_replayed() {
        let h = harness_with(
            TransferPolicy {
                single_use: true,
                ..policy()
            },
            Arc::new(SystemClock),
        );
        let ticket = upload(&h, "once.bin").await;
        h.service
            .get_download(ticket.code.as_str())
            .await
            .expect("first download");
        assert!(matches!(
            h.service.get_download(ticket.code.as_str()).await,
            Err(TransferError::InvalidOrExpiredCode)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_use_race_has_one_winner() {
        let h = harness_with(
            TransferPolicy {
                single_use: true,
                ..policy()
            },
            Arc::new(SystemClock),
        );
        let ticket = upload(&h, "race.bin").await;
        let mut handles = Vec::new();
        for _ in 0..16 {
            let service = h.service.clone();
            let code = ticket.code.as_str().to_string();
            handles.push(tokio::spawn(async move {
                service.get_download(&code).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.expect("join") {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn code_expires_at_ttl_without_a_sweep() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let h = harness_with(policy(), clock.clone());
        let ticket = upload(&h, "report.pdf").await;

        clock.advance(chrono::Duration::hours(24) - chrono::Duration::seconds(1));
        h.service
            .get_download(ticket.code.as_str())
            .await
            .expect("still valid");

        clock.advance(chrono::Duration::seconds(1));
        assert!(matches!(
            h.service.get_download(ticket.code.as_str()).await,
            Err(TransferError::InvalidOrExpiredCode)
        ));
    }

    #[tokio::test]
    async fn init_upload_validates_input() {
        let h = harness();
        let long_name = "a".repeat(MAX_FILENAME_LEN + 1);
        let cases = [
            ("", "text/plain"),
            ("   ", "text/plain"),
            ("a.txt", ""),
            ("a.txt", "not a mime"),
            (long_name.as_str(), "text/plain"),
        ];
        for (filename, content_type) in cases {
            assert!(
                matches!(
                    h.service.init_upload(filename, content_type).await,
                    Err(TransferError::Validation(_))
                ),
                "{filename:?} / {content_type:?} should fail validation"
            );
        }
        h.service
            .init_upload(&"a".repeat(MAX_FILENAME_LEN), "text/plain; charset=utf-8")
            .await
            .expect("limits are inclusive");
    }

    #[tokio::test]
    async fn awkward_filenames_still_get_a_code() {
        let h = harness();
        let wide = "\u{1F600}".repeat(130);
        for (filename, content_type) in [
            (". .", "text/plain"),
            (".. ..", "text/plain"),
            (wide.as_str(), "image/png"),
        ] {
            let ticket = h
                .service
                .init_upload(filename, content_type)
                .await
                .unwrap_or_else(|err| panic!("{filename:?} should be accepted: {err}"));
            let session = h
                .store
                .get(&ticket.code, Utc::now())
                .await
                .expect("store")
                .expect("session");
            assert_eq!(session.original_filename, filename);
        }
    }

    #[tokio::test]
    async fn upload_url_never_outlives_the_session() {
        let h = harness_with(
            TransferPolicy {
                session_ttl: Duration::from_secs(60),
                ..policy()
            },
            Arc::new(SystemClock),
        );
        let ticket = h
            .service
            .init_upload("a.txt", "text/plain")
            .await
            .expect("init upload");
        assert!(ticket.upload_url.ends_with("ttl=60"), "{}", ticket.upload_url);
    }

    #[tokio::test]
    async fn unrepresentable_session_ttl_is_a_server_fault() {
        let h = harness_with(
            TransferPolicy {
                session_ttl: Duration::from_secs(u64::MAX),
                ..policy()
            },
            Arc::new(SystemClock),
        );
        assert!(matches!(
            h.service.init_upload("a.txt", "text/plain").await,
            Err(TransferError::Misconfigured(_))
        ));
    }

    #[tokio::test]
    async fn gateway_failure_commits_no_session() {
        let h = harness();
        h.gateway.set_failing(true);
        assert!(matches!(
            h.service.init_upload("a.txt", "text/plain").await,
            Err(TransferError::Storage(_))
        ));
        let far_future = Utc::now() + chrono::Duration::days(30);
        assert!(h.store.list_expired(far_future, 10).await.expect("list").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_uploads_get_distinct_codes() {
        let h = harness();
        let mut handles = Vec::new();
        for i in 0..100 {
            let service = h.service.clone();
            handles.push(tokio::spawn(async move {
                service
                    .init_upload(&format!("file-{i}.bin"), "application/octet-stream")
                    .await
                    .expect("init upload")
                    .code
            }));
        }
        let mut codes = HashSet::new();
        for handle in handles {
            codes.insert(handle.await.expect("join"));
        }
        assert_eq!(codes.len(), 100);
    }
}
