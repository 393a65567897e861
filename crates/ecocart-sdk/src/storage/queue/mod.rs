use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use std::fmt::Debug;

use crate::error::Result;
use crate::storage::kv::{keys, KvStore};

pub mod priority;
pub mod sync_task;
pub mod retry_policy;
pub mod sync_consumer;

// 重新导出核心类型
pub use priority::{QueuePriority, PriorityComparator};
pub use sync_task::{SyncAction, SyncTask, TaskStatus, TaskFilter};
pub use retry_policy::{RetryManager, RetryPolicy, SyncFailureReason};
pub use sync_consumer::{SyncConsumerConfig, SyncConsumerRunner, SyncMetrics, SyncReport};

/// 队列统计信息
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub processing_tasks: usize,
    pub failed_tasks: usize,
    /// 等待中且已到重试时间的任务数（轮询触发器参考）
    pub due_tasks: usize,
    pub avg_age_ms: f64,
    pub priority_distribution: HashMap<u8, usize>,
}

impl QueueStats {
    fn from_tasks(tasks: &[SyncTask]) -> Self {
        let mut stats = QueueStats {
            total_tasks: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            match task.status {
                TaskStatus::Pending => {
                    stats.pending_tasks += 1;
                    if task.is_due() {
                        stats.due_tasks += 1;
                    }
                }
                TaskStatus::Processing => stats.processing_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                // 完成/取消的任务会被移出队列，不计入统计
                TaskStatus::Completed | TaskStatus::Cancelled => {}
            }
            *stats.priority_distribution.entry(task.priority).or_insert(0) += 1;
        }

        if !tasks.is_empty() {
            let total_age: u64 = tasks.iter().map(|t| t.age_ms()).sum();
            stats.avg_age_ms = total_age as f64 / tasks.len() as f64;
        }

        stats
    }
}

#[async_trait::async_trait]
pub trait SyncQueueTrait: Debug + Send + Sync {
    /// 推入任务（按 task_id 幂等覆盖，同一任务在队列中至多一条）
    async fn push(&self, task: SyncTask) -> Result<()>;
    async fn get(&self, task_id: &str) -> Result<Option<SyncTask>>;
    async fn remove(&self, task_id: &str) -> Result<()>;
    /// 清空队列，返回移除数量
    async fn clear(&self) -> Result<usize>;
    async fn len(&self) -> Result<usize>;
    async fn is_empty(&self) -> Result<bool>;
    /// 按处理顺序（优先级降序、创建时间升序）返回全量快照
    async fn snapshot_sorted(&self) -> Result<Vec<SyncTask>>;
    async fn stats(&self) -> Result<QueueStats>;

    /// 终态失败任务列表（手动重试 / 丢弃的入口）
    async fn failed_tasks(&self) -> Result<Vec<SyncTask>> {
        Ok(self
            .snapshot_sorted()
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect())
    }
}

/// 同步队列枚举 - 支持内存队列和持久化队列
#[derive(Debug)]
pub enum SyncQueue {
    Memory(MemorySyncQueue),
    Persistent(PersistentSyncQueue),
}

#[async_trait::async_trait]
impl SyncQueueTrait for SyncQueue {
    async fn push(&self, task: SyncTask) -> Result<()> {
        match self {
            SyncQueue::Memory(q) => q.push(task).await,
            SyncQueue::Persistent(q) => q.push(task).await,
        }
    }

    async fn get(&self, task_id: &str) -> Result<Option<SyncTask>> {
        match self {
            SyncQueue::Memory(q) => q.get(task_id).await,
            SyncQueue::Persistent(q) => q.get(task_id).await,
        }
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        match self {
            SyncQueue::Memory(q) => q.remove(task_id).await,
            SyncQueue::Persistent(q) => q.remove(task_id).await,
        }
    }

    async fn clear(&self) -> Result<usize> {
        match self {
            SyncQueue::Memory(q) => q.clear().await,
            SyncQueue::Persistent(q) => q.clear().await,
        }
    }

    async fn len(&self) -> Result<usize> {
        match self {
            SyncQueue::Memory(q) => q.len().await,
            SyncQueue::Persistent(q) => q.len().await,
        }
    }

    async fn is_empty(&self) -> Result<bool> {
        match self {
            SyncQueue::Memory(q) => q.is_empty().await,
            SyncQueue::Persistent(q) => q.is_empty().await,
        }
    }

    async fn snapshot_sorted(&self) -> Result<Vec<SyncTask>> {
        match self {
            SyncQueue::Memory(q) => q.snapshot_sorted().await,
            SyncQueue::Persistent(q) => q.snapshot_sorted().await,
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        match self {
            SyncQueue::Memory(q) => q.stats().await,
            SyncQueue::Persistent(q) => q.stats().await,
        }
    }
}

/// 基于内存的队列实现（测试和非持久化场景）
#[derive(Debug)]
pub struct MemorySyncQueue {
    tasks: Arc<RwLock<Vec<SyncTask>>>,
}

impl MemorySyncQueue {
    /// 创建新的内存队列
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl SyncQueueTrait for MemorySyncQueue {
    async fn push(&self, task: SyncTask) -> Result<()> {
        {
            let mut tasks = self.tasks.write().await;
            // 同 task_id 覆盖旧条目
            tasks.retain(|t| t.task_id != task.task_id);
            tasks.push(task);

            // 按处理顺序排序
            tasks.sort();

            debug!("任务已推入队列，当前队列大小: {}", tasks.len());
        } // 释放写锁

        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<SyncTask>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.iter().find(|t| t.task_id == task_id).cloned())
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        tasks.retain(|task| task.task_id != task_id);
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        let mut tasks = self.tasks.write().await;
        let removed = tasks.len();
        tasks.clear();
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let tasks = self.tasks.read().await;
        Ok(tasks.len())
    }

    async fn is_empty(&self) -> Result<bool> {
        let tasks = self.tasks.read().await;
        Ok(tasks.is_empty())
    }

    async fn snapshot_sorted(&self) -> Result<Vec<SyncTask>> {
        let tasks = self.tasks.read().await;
        let mut snapshot = tasks.clone();
        snapshot.sort();
        Ok(snapshot)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let tasks = self.tasks.read().await;
        Ok(QueueStats::from_tasks(&tasks))
    }
}

impl Default for MemorySyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// 持久化队列实现（`sync_queue:<task_id>` 一条一键，应用重启后恢复）
#[derive(Debug)]
pub struct PersistentSyncQueue {
    kv_store: Arc<KvStore>,
}

impl PersistentSyncQueue {
    pub fn new(kv_store: Arc<KvStore>) -> Self {
        Self { kv_store }
    }

    fn task_key(task_id: &str) -> String {
        format!("{}{}", keys::SYNC_QUEUE, task_id)
    }

    async fn get_all_tasks(&self) -> Result<Vec<SyncTask>> {
        let mut tasks = Vec::new();
        let items = self
            .kv_store
            .scan_prefix::<serde_json::Value>(keys::SYNC_QUEUE.as_bytes())
            .await?;

        for (key, value) in items {
            match serde_json::from_value::<SyncTask>(value) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    // 无法解析的条目跳过，不让单条脏数据卡死整个队列
                    warn!(
                        "跳过无法解析的队列条目 {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    );
                }
            }
        }

        tasks.sort();
        Ok(tasks)
    }
}

#[async_trait::async_trait]
impl SyncQueueTrait for PersistentSyncQueue {
    async fn push(&self, task: SyncTask) -> Result<()> {
        self.kv_store
            .set(Self::task_key(&task.task_id), &task)
            .await?;
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Option<SyncTask>> {
        self.kv_store.get(Self::task_key(task_id)).await
    }

    async fn remove(&self, task_id: &str) -> Result<()> {
        self.kv_store.delete(Self::task_key(task_id)).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self
            .kv_store
            .remove_prefix(keys::SYNC_QUEUE.as_bytes())
            .await?;
        Ok(removed as usize)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.get_all_tasks().await?.len())
    }

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_all_tasks().await?.is_empty())
    }

    async fn snapshot_sorted(&self) -> Result<Vec<SyncTask>> {
        self.get_all_tasks().await
    }

    async fn stats(&self) -> Result<QueueStats> {
        let tasks = self.get_all_tasks().await?;
        Ok(QueueStats::from_tasks(&tasks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::{CollectionRecord, EntityPayload};
    use tempfile::TempDir;

    fn make_task(priority: u8) -> SyncTask {
        SyncTask::new(
            SyncAction::Create,
            EntityPayload::Collection(CollectionRecord {
                address: Some("5 Recycle Road".to_string()),
                ..Default::default()
            }),
            None,
            None,
            priority,
            3,
        )
    }

    #[tokio::test]
    async fn test_memory_queue_basic_operations() {
        let queue = MemorySyncQueue::new();

        let task = make_task(3);
        let task_id = task.task_id.clone();

        queue.push(task.clone()).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        // 同 task_id 再推入是覆盖，不是追加
        queue.push(task).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        let fetched = queue.get(&task_id).await.unwrap();
        assert!(fetched.is_some());

        queue.remove(&task_id).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_queue_priority_ordering() {
        let queue = MemorySyncQueue::new();

        // 按 1、5、3 的顺序入队
        for priority in [1u8, 5, 3] {
            queue.push(make_task(priority)).await.unwrap();
        }

        // 快照应按 5、3、1 排列
        let snapshot = queue.snapshot_sorted().await.unwrap();
        let priorities: Vec<u8> = snapshot.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![5, 3, 1]);
    }

    #[tokio::test]
    async fn test_persistent_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());

        let task = make_task(5);
        let task_id = task.task_id.clone();

        {
            let queue = PersistentSyncQueue::new(kv.clone());
            queue.push(task).await.unwrap();
            assert_eq!(queue.len().await.unwrap(), 1);
        }

        // 用同一个存储重新构建队列，任务仍在
        let queue = PersistentSyncQueue::new(kv);
        assert_eq!(queue.len().await.unwrap(), 1);
        let restored = queue.get(&task_id).await.unwrap().unwrap();
        assert_eq!(restored.priority, 5);
        assert_eq!(restored.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_persistent_queue_clear_and_stats() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::new(temp_dir.path()).await.unwrap());
        let queue = PersistentSyncQueue::new(kv.clone());

        queue.push(make_task(1)).await.unwrap();
        queue.push(make_task(8)).await.unwrap();

        let mut failed = make_task(3);
        failed.mark_failed("HTTP 403: forbidden".to_string(), Some(SyncFailureReason::Forbidden));
        queue.push(failed).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.pending_tasks, 2);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.due_tasks, 2);

        let failed_list = queue.failed_tasks().await.unwrap();
        assert_eq!(failed_list.len(), 1);

        // 清空只影响队列命名空间
        kv.set("api_cache:other", &serde_json::json!({"v": 1})).await.unwrap();
        let removed = queue.clear().await.unwrap();
        assert_eq!(removed, 3);
        assert!(queue.is_empty().await.unwrap());
        assert!(kv.exists("api_cache:other").await.unwrap());
    }
}
