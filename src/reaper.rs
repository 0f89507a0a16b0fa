//! 过期清理：回收超过 TTL 的会话对象与记录。
//!
//! 读取时已将过期会话视为不存在，正确性不依赖清理是否运行。
//! 清理只负责释放空间；每一步都是幂等删除或比较并设置，重叠清理也安全。

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::session::{SessionStatus, SessionStore, StoreError};
use crate::storage::StorageGateway;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// 对象删除后转为 `deleted` 的会话数。
    pub reaped: usize,
    /// 物理删除的已删除记录数。
    pub purged: usize,
    /// 删除失败的对象数；对应会话留待下次清理。
    pub failed: usize,
}

pub struct Reaper {
    store: Arc<dyn SessionStore>,
    gateway: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    batch_size: u32,
}

impl Reaper {
    pub fn new(
        store: Arc<dyn SessionStore>,
        gateway: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        batch_size: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();
        let mut failed_keys = HashSet::new();

        loop {
            let batch = self
                .store
                .list_expired(now, self.page_size(&failed_keys))
                .await?;
            let mut progressed = false;
            for session in batch {
                if failed_keys.contains(&session.object_key) {
                    continue;
                }
                if let Err(err) = self.gateway.delete(&session.object_key).await {
                    warn!(
                        code = %session.code,
                        key = %session.object_key,
                        error = %err,
                        "object delete failed, session kept for next sweep"
                    );
                    report.failed += 1;
                    failed_keys.insert(session.object_key);
                    progressed = true;
                    continue;
                }
                let reaped = self
                    .store
                    .transition_status(
                        &session.code,
                        &session.object_key,
                        session.status,
                        SessionStatus::Deleted,
                    )
                    .await?;
                if reaped {
                    debug!(code = %session.code, key = %session.object_key, "session reaped");
                    report.reaped += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        loop {
            let batch = self
                .store
                .list_retired(now, self.page_size(&failed_keys))
                .await?;
            let mut progressed = false;
            for session in batch {
                if failed_keys.contains(&session.object_key) {
                    continue;
                }
                // 单次取件会话转为 `deleted` 时对象仍在存储中。
                if let Err(err) = self.gateway.delete(&session.object_key).await {
                    warn!(key = %session.object_key, error = %err, "object delete failed before purge");
                    report.failed += 1;
                    failed_keys.insert(session.object_key);
                    progressed = true;
                    continue;
                }
                if self.store.purge(&session.object_key).await? {
                    report.purged += 1;
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        if report == SweepReport::default() {
            debug!("sweep found nothing to reclaim");
        } else {
            info!(
                reaped = report.reaped,
                purged = report.purged,
                failed = report.failed,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// 列表按到期时间升序，本轮删除失败的行会被再次取回；
    /// 因此按失败数扩大分页，避免它们挤占其余会话。
    fn page_size(&self, failed_keys: &HashSet<String>) -> u32 {
        let skipped = u32::try_from(failed_keys.len()).unwrap_or(u32::MAX);
        self.batch_size.saturating_add(skipped)
    }
}
