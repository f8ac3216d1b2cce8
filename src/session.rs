//! 上传会话表：每个会话自带追加锁，互不阻塞。

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::fs;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};
use uuid::Uuid;

use crate::storage::Storage;

/// One in-flight chunked upload.
///
/// Counters are atomics so progress reads never wait on the append lock;
/// the lock only serializes spill-file writes for this session.
#[derive(Debug)]
pub struct UploadSession {
    pub id: String,
    pub file_name: String,
    pub total_bytes: u64,
    started_at_ms: i64,
    transferred: AtomicU64,
    last_activity_ms: AtomicI64,
    append_lock: Mutex<()>,
}

impl UploadSession {
    fn new(file_name: String, total_bytes: u64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            file_name,
            total_bytes,
            started_at_ms: now,
            transferred: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(now),
            append_lock: Mutex::new(()),
        }
    }

    pub fn started_at_ms(&self) -> i64 {
        self.started_at_ms
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    /// 记录一次成功写入：推进字节计数并刷新活跃时间。
    pub fn record_append(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Release);
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// 串行化本会话的追加与完成操作；不同会话互不等待。
    pub async fn append_guard(&self) -> MutexGuard<'_, ()> {
        self.append_lock.lock().await
    }

    fn idle_for(&self, now_ms: i64) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms.saturating_sub(last).max(0) as u64)
    }
}

/// Shared table of in-flight sessions keyed by upload id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<UploadSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// 创建新会话并放入会话表，返回会话句柄。
    pub fn start(&self, file_name: String, total_bytes: u64) -> Arc<UploadSession> {
        let session = Arc::new(UploadSession::new(file_name, total_bytes));
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    pub fn get(&self, upload_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.get(upload_id).map(|entry| entry.value().clone())
    }

    /// 删除会话；对不存在的 id 是幂等的空操作。
    pub fn remove(&self, upload_id: &str) -> Option<Arc<UploadSession>> {
        self.sessions.remove(upload_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    fn collect_idle(&self, ttl: Duration) -> Vec<Arc<UploadSession>> {
        let now_ms = Utc::now().timestamp_millis();
        self.sessions
            .iter()
            .filter(|entry| entry.idle_for(now_ms) >= ttl)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

/// 清理超过闲置阈值的会话及其临时文件。
pub async fn sweep_idle_sessions(registry: &SessionRegistry, storage: &Storage, ttl: Duration) {
    if ttl.is_zero() {
        return;
    }

    for session in registry.collect_idle(ttl) {
        // Take the append lock so the removal cannot straddle a queued chunk
        // write, then re-check idleness: an append may have landed meanwhile.
        let _guard = session.append_guard().await;
        if session.idle_for(Utc::now().timestamp_millis()) < ttl {
            continue;
        }
        if registry.remove(&session.id).is_none() {
            continue;
        }
        let spill = storage.spill_path(&session.id);
        match fs::remove_file(&spill).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(upload_id = %session.id, error = %err, "failed to remove stale spill file");
                continue;
            }
        }
        info!(
            upload_id = %session.id,
            name = %session.file_name,
            transferred = session.transferred(),
            "swept idle upload session"
        );
    }
}
