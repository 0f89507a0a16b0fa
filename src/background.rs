//! 定期过期清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::reaper::Reaper;

/// 每隔 `interval` 运行一次清理；间隔为零时返回 `None`。
pub fn spawn_reaper(reaper: Arc<Reaper>, interval: Duration) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        info!("expiry sweeps disabled");
        return None;
    }
    info!(interval_secs = interval.as_secs(), "expiry sweeps scheduled");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = reaper.sweep().await {
                warn!(error = %err, "expiry sweep failed");
            }
        }
    }))
}
