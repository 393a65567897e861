//! 存储模块 - SDK 的数据持久化层
//!
//! 采用分层架构设计：
//! - StorageManager: 统一的存储管理器，持有 KV 存储并提供计数器 / 元数据 API
//! - KvStore: 基于 sled 的键值存储，队列、响应缓存、计数器共用一个命名空间
//! - Entities: 数据实体定义，类型安全的变更载荷
//! - Queue: 离线变更队列（内存 / 持久化两种实现）与同步消费循环

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{EcoCartSDKError, Result};

pub mod entities;
pub mod kv;
pub mod queue;

// 重新导出核心类型
pub use entities::*;
pub use kv::{keys, KvStore};
pub use queue::{
    MemorySyncQueue, PersistentSyncQueue, QueuePriority, QueueStats, RetryManager, RetryPolicy,
    SyncAction, SyncConsumerConfig, SyncConsumerRunner, SyncFailureReason, SyncMetrics, SyncQueue,
    SyncQueueTrait, SyncReport, SyncTask, TaskStatus,
};

/// KV 存储统计信息
#[derive(Debug, Clone)]
pub struct KvStats {
    pub tree_size: u64,
    pub key_count: u64,
    pub total_keys: u64,
    pub storage_size: u64,
}

/// 存储管理器 - 数据目录与 KV 存储的统一入口
///
/// 队列、API 响应缓存都落在同一个 KvStore 里，本管理器额外提供
/// 同步完成计数器和最近同步时间这两个跨模块共享的元数据。
#[derive(Debug)]
pub struct StorageManager {
    base_path: PathBuf,
    kv: Arc<KvStore>,
}

impl StorageManager {
    /// 创建新的存储管理器
    ///
    /// # 参数
    /// - `base_path`: 数据存储的基础路径（KV 存储位于 `{base_path}/kv`）
    pub async fn new(base_path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_path)
            .await
            .map_err(|e| EcoCartSDKError::IO(format!("创建存储目录失败: {}", e)))?;

        let kv = Arc::new(KvStore::new(base_path).await?);

        info!("✅ 存储管理器已就绪: {}", base_path.display());

        Ok(Self {
            base_path: base_path.to_path_buf(),
            kv,
        })
    }

    /// 获取底层 KV 存储（队列 / API 客户端共享同一实例）
    pub fn kv(&self) -> Arc<KvStore> {
        self.kv.clone()
    }

    /// 获取基础数据目录
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 累计成功同步的变更条数
    pub async fn sync_completed_count(&self) -> Result<i64> {
        self.kv.get_counter(keys::SYNC_COMPLETED_COUNT).await
    }

    /// 同步完成计数 +1，返回新值
    pub async fn increment_sync_completed(&self) -> Result<i64> {
        self.kv.increment_counter(keys::SYNC_COMPLETED_COUNT, 1).await
    }

    /// 最近一次成功走完同步的时间（毫秒时间戳）
    pub async fn last_sync_at(&self) -> Result<Option<u64>> {
        self.kv.get(keys::LAST_SYNC_AT).await
    }

    /// 记录同步时间
    pub async fn set_last_sync_at(&self, timestamp_ms: u64) -> Result<()> {
        self.kv.set(keys::LAST_SYNC_AT, &timestamp_ms).await
    }

    /// 清理已过期的 TTL 缓存条目，返回清理数量
    pub async fn purge_expired_cache(&self) -> Result<u64> {
        self.kv.cleanup_expired().await
    }

    /// 获取存储统计信息
    pub async fn stats(&self) -> Result<KvStats> {
        self.kv.get_stats().await
    }

    /// 把未落盘的写入刷到磁盘（关停时调用）
    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sync_completed_counter() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::new(temp_dir.path()).await.unwrap();

        assert_eq!(storage.sync_completed_count().await.unwrap(), 0);

        assert_eq!(storage.increment_sync_completed().await.unwrap(), 1);
        assert_eq!(storage.increment_sync_completed().await.unwrap(), 2);
        assert_eq!(storage.sync_completed_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_last_sync_at_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::new(temp_dir.path()).await.unwrap();

        assert!(storage.last_sync_at().await.unwrap().is_none());

        let now = chrono::Utc::now().timestamp_millis() as u64;
        storage.set_last_sync_at(now).await.unwrap();
        assert_eq!(storage.last_sync_at().await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn test_counter_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();

        {
            let storage = StorageManager::new(temp_dir.path()).await.unwrap();
            storage.increment_sync_completed().await.unwrap();
            storage.flush().await.unwrap();
        }

        // 同一目录重新打开，计数仍在
        let storage = StorageManager::new(temp_dir.path()).await.unwrap();
        assert_eq!(storage.sync_completed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_reflect_writes() {
        let temp_dir = TempDir::new().unwrap();
        let storage = StorageManager::new(temp_dir.path()).await.unwrap();

        storage.kv().set("some_key", &42u32).await.unwrap();
        let stats = storage.stats().await.unwrap();
        assert!(stats.key_count >= 1);
    }
}
