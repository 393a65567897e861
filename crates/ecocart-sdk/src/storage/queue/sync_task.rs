use crate::storage::entities::{EntityPayload, EntityType};
use crate::storage::queue::priority::QueuePriority;
use crate::storage::queue::retry_policy::SyncFailureReason;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 同步任务结构体（队列中的一条待上行变更）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    /// 任务ID（入队时生成的 UUID v4，队列中唯一）
    pub task_id: String,
    pub action: SyncAction,
    /// REST 端点（默认由实体类型推导，可覆盖）
    pub endpoint: String,
    /// 目标记录ID（update / delete 必填）
    pub record_id: Option<String>,
    /// 类型化变更载荷
    pub data: EntityPayload,
    /// 变更基于的服务端版本号（冲突检测用）
    pub base_version: Option<u64>,
    /// 入队时间（毫秒时间戳）
    pub created_at: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 下次重试时间（毫秒时间戳，None 表示立即可处理）
    pub next_retry_at: Option<u64>,
    /// 裸优先级数值，越大越紧急
    pub priority: u8,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub last_failure_reason: Option<SyncFailureReason>,
}

/// 任务状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// 等待同步
    Pending,
    /// 正在同步
    Processing,
    /// 同步完成
    Completed,
    /// 同步失败（终态，等待手动重试或丢弃）
    Failed,
    /// 已取消
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "等待同步"),
            TaskStatus::Processing => write!(f, "正在同步"),
            TaskStatus::Completed => write!(f, "同步完成"),
            TaskStatus::Failed => write!(f, "同步失败"),
            TaskStatus::Cancelled => write!(f, "已取消"),
        }
    }
}

impl SyncTask {
    /// 创建新的同步任务（端点由实体类型推导）
    pub fn new(
        action: SyncAction,
        data: EntityPayload,
        record_id: Option<String>,
        base_version: Option<u64>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        let created_at = chrono::Utc::now().timestamp_millis() as u64;
        let task_id = uuid::Uuid::new_v4().to_string();
        let endpoint = data.entity_type().endpoint().to_string();

        Self {
            task_id,
            action,
            endpoint,
            record_id,
            data,
            base_version,
            created_at,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            priority,
            status: TaskStatus::Pending,
            last_error: None,
            last_failure_reason: None,
        }
    }

    /// 覆盖默认端点
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// 任务载荷的实体类型
    pub fn entity_type(&self) -> EntityType {
        self.data.entity_type()
    }

    /// 检查是否还有重试额度（Failed / Cancelled 为终态）
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
            && matches!(self.status, TaskStatus::Pending | TaskStatus::Processing)
    }

    /// 检查是否已到重试时间
    pub fn is_due(&self) -> bool {
        match self.next_retry_at {
            Some(at) => chrono::Utc::now().timestamp_millis() as u64 >= at,
            None => true,
        }
    }

    /// 本轮是否应该处理（等待中且到达重试时间）
    pub fn should_process(&self) -> bool {
        self.status == TaskStatus::Pending && self.is_due()
    }

    /// 累加一次失败尝试
    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    /// 排期下一次重试，任务回到等待状态（退避时间由 RetryPolicy 计算）
    pub fn schedule_retry(&mut self, next_retry_at: u64) {
        self.next_retry_at = Some(next_retry_at);
        self.status = TaskStatus::Pending;
    }

    /// 标记任务为处理中
    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
    }

    /// 标记任务为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.next_retry_at = None;
        self.last_error = None;
    }

    /// 标记任务为失败终态
    pub fn mark_failed(&mut self, error: String, failure_reason: Option<SyncFailureReason>) {
        self.status = TaskStatus::Failed;
        self.next_retry_at = None;
        self.last_error = Some(error);
        self.last_failure_reason = failure_reason;
    }

    /// 标记任务为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.next_retry_at = None;
    }

    /// 手动重试：清零重试计数，回到等待状态
    pub fn reset_for_retry(&mut self) {
        self.retry_count = 0;
        self.next_retry_at = None;
        self.status = TaskStatus::Pending;
        self.last_error = None;
        self.last_failure_reason = None;
    }

    /// 获取任务年龄 (毫秒)，时钟回拨时按 0 处理
    pub fn age_ms(&self) -> u64 {
        (chrono::Utc::now().timestamp_millis() as u64).saturating_sub(self.created_at)
    }

    /// 获取下次重试剩余时间 (毫秒)
    pub fn remaining_retry_ms(&self) -> Option<i64> {
        self.next_retry_at
            .map(|retry_at| retry_at as i64 - chrono::Utc::now().timestamp_millis() as i64)
    }

    /// 裸优先级归档到命名档位（显示 / 统计用）
    pub fn named_priority(&self) -> QueuePriority {
        QueuePriority::from(self.priority)
    }

    /// 获取任务的详细信息字符串
    pub fn details(&self) -> String {
        format!(
            "SyncTask(id={}, action={}, entity={}, priority={}, status={}, retry={}/{}, age={}ms)",
            self.task_id,
            self.action,
            self.entity_type(),
            self.priority,
            self.status,
            self.retry_count,
            self.max_retries,
            self.age_ms()
        )
    }
}

/// 任务比较器 - 用于队列排序
///
/// 排序规则：
/// 1. 优先级数值大的任务先处理
/// 2. 相同优先级下，创建时间早的先处理
impl Ord for SyncTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let priority_cmp = other.priority.cmp(&self.priority);
        if priority_cmp != std::cmp::Ordering::Equal {
            return priority_cmp;
        }

        self.created_at.cmp(&other.created_at)
    }
}

impl PartialOrd for SyncTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SyncTask {
    fn eq(&self, other: &Self) -> bool {
        self.task_id == other.task_id
    }
}

impl Eq for SyncTask {}

/// 任务过滤器
pub struct TaskFilter {
    pub entity_type: Option<EntityType>,
    pub action: Option<SyncAction>,
    pub status: Option<TaskStatus>,
    pub min_priority: Option<u8>,
    pub max_age_ms: Option<u64>,
}

impl TaskFilter {
    /// 创建新的过滤器
    pub fn new() -> Self {
        Self {
            entity_type: None,
            action: None,
            status: None,
            min_priority: None,
            max_age_ms: None,
        }
    }

    /// 设置实体类型过滤
    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    /// 设置动作过滤
    pub fn with_action(mut self, action: SyncAction) -> Self {
        self.action = Some(action);
        self
    }

    /// 设置状态过滤
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// 设置最低优先级过滤
    pub fn with_min_priority(mut self, min_priority: u8) -> Self {
        self.min_priority = Some(min_priority);
        self
    }

    /// 设置最大年龄过滤
    pub fn with_max_age_ms(mut self, max_age_ms: u64) -> Self {
        self.max_age_ms = Some(max_age_ms);
        self
    }

    /// 检查任务是否匹配过滤条件
    pub fn matches(&self, task: &SyncTask) -> bool {
        if let Some(entity_type) = self.entity_type {
            if task.entity_type() != entity_type {
                return false;
            }
        }

        if let Some(action) = self.action {
            if task.action != action {
                return false;
            }
        }

        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }

        if let Some(min_priority) = self.min_priority {
            if task.priority < min_priority {
                return false;
            }
        }

        if let Some(max_age_ms) = self.max_age_ms {
            if task.age_ms() > max_age_ms {
                return false;
            }
        }

        true
    }
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::CollectionRecord;

    fn collection_payload(id: Option<&str>) -> EntityPayload {
        EntityPayload::Collection(CollectionRecord {
            id: id.map(|s| s.to_string()),
            address: Some("12 Green Lane".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_sync_task_creation() {
        let task = SyncTask::new(
            SyncAction::Create,
            collection_payload(None),
            None,
            None,
            QueuePriority::Normal.value(),
            3,
        );
        assert!(!task.task_id.is_empty());
        assert_eq!(task.endpoint, "/collections");
        assert_eq!(task.entity_type(), EntityType::Collections);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.can_retry());
        assert!(task.should_process());
    }

    #[test]
    fn test_task_retry_logic() {
        let mut task = SyncTask::new(
            SyncAction::Update,
            collection_payload(Some("col_1")),
            Some("col_1".to_string()),
            Some(1),
            QueuePriority::High.value(),
            3,
        );

        // 失败后：先记一次尝试，再排期重试回到等待
        let future = chrono::Utc::now().timestamp_millis() as u64 + 60_000;
        task.mark_processing();
        task.increment_retry();
        task.schedule_retry(future);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_due());
        assert!(!task.should_process());

        // 失败终态不再参与重试
        task.mark_failed("HTTP 500: boom".to_string(), Some(SyncFailureReason::ServerError(500)));
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(!task.can_retry());
        assert!(task.next_retry_at.is_none());

        // 手动重试完全复位
        task.reset_for_retry();
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.last_error.is_none());
        assert!(task.should_process());
    }

    #[test]
    fn test_age_ms_survives_clock_rollback() {
        let mut task = SyncTask::new(
            SyncAction::Create,
            collection_payload(None),
            None,
            None,
            QueuePriority::Normal.value(),
            3,
        );
        task.created_at = chrono::Utc::now().timestamp_millis() as u64 + 60_000;
        assert_eq!(task.age_ms(), 0);
    }

    #[test]
    fn test_task_ordering() {
        let mut low = SyncTask::new(
            SyncAction::Create,
            collection_payload(None),
            None,
            None,
            1,
            3,
        );
        let mut high = SyncTask::new(
            SyncAction::Create,
            collection_payload(None),
            None,
            None,
            5,
            3,
        );
        let mut mid = SyncTask::new(
            SyncAction::Create,
            collection_payload(None),
            None,
            None,
            3,
            3,
        );
        // 固定创建时间，只比优先级
        low.created_at = 100;
        high.created_at = 200;
        mid.created_at = 300;

        let mut tasks = vec![low.clone(), high.clone(), mid.clone()];
        tasks.sort();
        let priorities: Vec<u8> = tasks.iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![5, 3, 1]);

        // 相同优先级按创建时间升序
        let mut a = high.clone();
        let mut b = high.clone();
        a.created_at = 50;
        b.created_at = 60;
        assert!(a < b);
    }

    #[test]
    fn test_task_filter() {
        let task = SyncTask::new(
            SyncAction::Delete,
            collection_payload(Some("col_9")),
            Some("col_9".to_string()),
            Some(4),
            QueuePriority::Critical.value(),
            3,
        );

        let filter = TaskFilter::new()
            .with_entity_type(EntityType::Collections)
            .with_action(SyncAction::Delete)
            .with_status(TaskStatus::Pending)
            .with_min_priority(5);
        assert!(filter.matches(&task));

        let filter2 = TaskFilter::new().with_entity_type(EntityType::Users);
        assert!(!filter2.matches(&task));

        let filter3 = TaskFilter::new().with_status(TaskStatus::Failed);
        assert!(!filter3.matches(&task));
    }
}
