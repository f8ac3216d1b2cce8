//! 闲置上传会话清理的后台任务。

use std::sync::Arc;
use std::time::Duration;

use crate::config::{SESSION_SWEEP_INTERVAL_SECS, TransferConfig};
use crate::session::{SessionRegistry, sweep_idle_sessions};
use crate::storage::Storage;

/// 启动周期性清理任务：取消超过闲置阈值的会话并删除其临时文件。
pub fn spawn_background_tasks(
    registry: Arc<SessionRegistry>,
    storage: Arc<Storage>,
    config: Arc<TransferConfig>,
) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(SESSION_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            sweep_idle_sessions(&registry, &storage, config.session_idle_ttl).await;
        }
    });
}
