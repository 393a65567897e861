//! 事件系统模块 - 对宿主 UI 暴露 SDK 内部进展
//!
//! 功能包括：
//! - 队列变更事件（入队/清空）
//! - 同步过程事件（开始/单项成功/重试排期/终态失败/一轮完成）
//! - 冲突解决事件
//! - 缓存清理事件
//! - 事件广播和订阅机制

use crate::network::NetworkStatus;
use crate::storage::entities::EntityType;
use crate::storage::queue::SyncAction;
use crate::sync::ConflictKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 网络状态变更
    NetworkStatusChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
        timestamp: u64,
    },
    /// 一轮同步开始
    SyncStarted {
        pending: usize,
        timestamp: u64,
    },
    /// 一轮同步结束
    SyncPassCompleted {
        attempted: usize,
        succeeded: usize,
        failed: usize,
        conflicts_resolved: usize,
        timestamp: u64,
    },
    /// 一轮同步整体失败（如读取队列时存储出错），本轮未处理任何任务
    SyncPassFailed {
        error: String,
        timestamp: u64,
    },
    /// 单条变更同步成功
    MutationSynced {
        task_id: String,
        entity_type: EntityType,
        action: SyncAction,
        timestamp: u64,
    },
    /// 单条变更失败后排期重试
    MutationRetryScheduled {
        task_id: String,
        retry_count: u32,
        next_retry_at: u64,
        timestamp: u64,
    },
    /// 单条变更进入终态失败（等待手动重试或丢弃）
    MutationFailed {
        task_id: String,
        entity_type: EntityType,
        error: String,
        timestamp: u64,
    },
    /// 冲突已按策略解决
    ConflictResolved {
        task_id: String,
        entity_type: EntityType,
        kind: ConflictKind,
        timestamp: u64,
    },
    /// 变更入队
    QueueItemAdded {
        task_id: String,
        entity_type: EntityType,
        priority: u8,
        timestamp: u64,
    },
    /// 队列被清空
    QueueCleared {
        removed: usize,
        timestamp: u64,
    },
    /// 响应缓存被清空
    CacheCleared {
        entries_removed: u64,
        timestamp: u64,
    },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::NetworkStatusChanged { .. } => "network_status_changed",
            SDKEvent::SyncStarted { .. } => "sync_started",
            SDKEvent::SyncPassCompleted { .. } => "sync_pass_completed",
            SDKEvent::SyncPassFailed { .. } => "sync_pass_failed",
            SDKEvent::MutationSynced { .. } => "mutation_synced",
            SDKEvent::MutationRetryScheduled { .. } => "mutation_retry_scheduled",
            SDKEvent::MutationFailed { .. } => "mutation_failed",
            SDKEvent::ConflictResolved { .. } => "conflict_resolved",
            SDKEvent::QueueItemAdded { .. } => "queue_item_added",
            SDKEvent::QueueCleared { .. } => "queue_cleared",
            SDKEvent::CacheCleared { .. } => "cache_cleared",
        }
    }

    /// 获取事件时间戳
    pub fn timestamp(&self) -> u64 {
        match self {
            SDKEvent::NetworkStatusChanged { timestamp, .. } => *timestamp,
            SDKEvent::SyncStarted { timestamp, .. } => *timestamp,
            SDKEvent::SyncPassCompleted { timestamp, .. } => *timestamp,
            SDKEvent::SyncPassFailed { timestamp, .. } => *timestamp,
            SDKEvent::MutationSynced { timestamp, .. } => *timestamp,
            SDKEvent::MutationRetryScheduled { timestamp, .. } => *timestamp,
            SDKEvent::MutationFailed { timestamp, .. } => *timestamp,
            SDKEvent::ConflictResolved { timestamp, .. } => *timestamp,
            SDKEvent::QueueItemAdded { timestamp, .. } => *timestamp,
            SDKEvent::QueueCleared { timestamp, .. } => *timestamp,
            SDKEvent::CacheCleared { timestamp, .. } => *timestamp,
        }
    }

    /// 获取事件关联的实体类型
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            SDKEvent::MutationSynced { entity_type, .. } => Some(*entity_type),
            SDKEvent::MutationFailed { entity_type, .. } => Some(*entity_type),
            SDKEvent::ConflictResolved { entity_type, .. } => Some(*entity_type),
            SDKEvent::QueueItemAdded { entity_type, .. } => Some(*entity_type),
            _ => None,
        }
    }

    /// 获取事件关联的任务ID
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SDKEvent::MutationSynced { task_id, .. } => Some(task_id),
            SDKEvent::MutationRetryScheduled { task_id, .. } => Some(task_id),
            SDKEvent::MutationFailed { task_id, .. } => Some(task_id),
            SDKEvent::ConflictResolved { task_id, .. } => Some(task_id),
            SDKEvent::QueueItemAdded { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 实体类型过滤器
    pub entity_types: Option<Vec<EntityType>>,
}

impl EventFilter {
    /// 创建新的事件过滤器
    pub fn new() -> Self {
        Self {
            event_types: None,
            entity_types: None,
        }
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加实体类型过滤
    pub fn with_entity_types(mut self, entity_types: Vec<EntityType>) -> Self {
        self.entity_types = Some(entity_types);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SDKEvent) -> bool {
        // 检查事件类型
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type().to_string()) {
                return false;
            }
        }

        // 检查实体类型
        if let Some(ref entity_types) = self.entity_types {
            if let Some(entity_type) = event.entity_type() {
                if !entity_types.contains(&entity_type) {
                    return false;
                }
            } else {
                return false; // 事件没有实体类型但过滤器要求有
            }
        }

        true
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SDKEvent>,
    /// 事件监听器映射
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<u64>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        // 更新统计
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景如无 UI 宿主，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 调用监听器
        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        // 调用通用监听器
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub async fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub async fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        let receiver = self.sender.subscribe();
        FilteredEventReceiver::new(receiver, filter)
    }

    /// 添加事件监听器
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        // 更新监听器统计
        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 创建新的过滤事件接收器
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    /// 创建网络状态变更事件
    pub fn network_status_changed(
        old_status: NetworkStatus,
        new_status: NetworkStatus,
    ) -> SDKEvent {
        SDKEvent::NetworkStatusChanged {
            old_status,
            new_status,
            timestamp: now_ms(),
        }
    }

    /// 创建同步开始事件
    pub fn sync_started(pending: usize) -> SDKEvent {
        SDKEvent::SyncStarted {
            pending,
            timestamp: now_ms(),
        }
    }

    /// 创建同步结束事件
    pub fn sync_pass_completed(
        attempted: usize,
        succeeded: usize,
        failed: usize,
        conflicts_resolved: usize,
    ) -> SDKEvent {
        SDKEvent::SyncPassCompleted {
            attempted,
            succeeded,
            failed,
            conflicts_resolved,
            timestamp: now_ms(),
        }
    }

    /// 创建轮级失败事件
    pub fn sync_pass_failed(error: String) -> SDKEvent {
        SDKEvent::SyncPassFailed {
            error,
            timestamp: now_ms(),
        }
    }

    /// 创建变更同步成功事件
    pub fn mutation_synced(
        task_id: String,
        entity_type: EntityType,
        action: SyncAction,
    ) -> SDKEvent {
        SDKEvent::MutationSynced {
            task_id,
            entity_type,
            action,
            timestamp: now_ms(),
        }
    }

    /// 创建重试排期事件
    pub fn mutation_retry_scheduled(
        task_id: String,
        retry_count: u32,
        next_retry_at: u64,
    ) -> SDKEvent {
        SDKEvent::MutationRetryScheduled {
            task_id,
            retry_count,
            next_retry_at,
            timestamp: now_ms(),
        }
    }

    /// 创建终态失败事件
    pub fn mutation_failed(task_id: String, entity_type: EntityType, error: String) -> SDKEvent {
        SDKEvent::MutationFailed {
            task_id,
            entity_type,
            error,
            timestamp: now_ms(),
        }
    }

    /// 创建冲突解决事件
    pub fn conflict_resolved(
        task_id: String,
        entity_type: EntityType,
        kind: ConflictKind,
    ) -> SDKEvent {
        SDKEvent::ConflictResolved {
            task_id,
            entity_type,
            kind,
            timestamp: now_ms(),
        }
    }

    /// 创建入队事件
    pub fn queue_item_added(task_id: String, entity_type: EntityType, priority: u8) -> SDKEvent {
        SDKEvent::QueueItemAdded {
            task_id,
            entity_type,
            priority,
            timestamp: now_ms(),
        }
    }

    /// 创建队列清空事件
    pub fn queue_cleared(removed: usize) -> SDKEvent {
        SDKEvent::QueueCleared {
            removed,
            timestamp: now_ms(),
        }
    }

    /// 创建缓存清空事件
    pub fn cache_cleared(entries_removed: u64) -> SDKEvent {
        SDKEvent::CacheCleared {
            entries_removed,
            timestamp: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);

        // 测试订阅
        let mut receiver = manager.subscribe().await;

        // 测试发布事件
        let event =
            event_builders::queue_item_added("task_1".to_string(), EntityType::Collections, 5);
        manager.emit(event).await;

        // 测试接收事件
        let received_event = receiver.recv().await.unwrap();
        assert_eq!(received_event.event_type(), "queue_item_added");
        assert_eq!(received_event.task_id(), Some("task_1"));

        // 测试统计
        let stats = manager.get_stats().await;
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("queue_item_added"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);

        // 创建过滤器
        let filter = EventFilter::new()
            .with_event_types(vec!["mutation_synced".to_string()])
            .with_entity_types(vec![EntityType::Collections]);

        let mut filtered_receiver = manager.subscribe_filtered(filter).await;

        // 发布不匹配的事件（实体类型不同）
        let non_matching = event_builders::mutation_synced(
            "task_a".to_string(),
            EntityType::Materials,
            SyncAction::Create,
        );
        manager.emit(non_matching).await;

        // 发布匹配的事件
        let matching = event_builders::mutation_synced(
            "task_b".to_string(),
            EntityType::Collections,
            SyncAction::Update,
        );
        manager.emit(matching).await;

        // 应该只接收到匹配的事件
        let received_event = filtered_receiver.recv().await.unwrap();
        assert_eq!(received_event.task_id(), Some("task_b"));
        assert_eq!(received_event.entity_type(), Some(EntityType::Collections));
    }

    #[tokio::test]
    async fn test_event_listeners() {
        let manager = EventManager::new(100);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        // 添加监听器
        manager
            .add_listener("sync_started", move |_event| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        // 发布事件
        for pending in 0..3 {
            manager.emit(event_builders::sync_started(pending)).await;
        }

        // 等待一下确保监听器被调用
        sleep(Duration::from_millis(10)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wildcard_listener_sees_all_events() {
        let manager = EventManager::new(100);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        manager
            .add_listener("*", move |_event| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        manager.emit(event_builders::sync_started(1)).await;
        manager.emit(event_builders::queue_cleared(4)).await;
        manager.emit(event_builders::cache_cleared(2)).await;

        sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = EventManager::new(100);

        let mut receiver1 = manager.subscribe().await;
        let mut receiver2 = manager.subscribe().await;

        assert_eq!(manager.subscriber_count(), 2);

        let event = event_builders::sync_pass_completed(3, 2, 1, 0);
        manager.emit(event).await;

        // 两个订阅者都应该收到事件
        let event1 = receiver1.recv().await.unwrap();
        let event2 = receiver2.recv().await.unwrap();

        assert_eq!(event1.event_type(), "sync_pass_completed");
        assert_eq!(event2.event_type(), "sync_pass_completed");
    }

    #[tokio::test]
    async fn test_event_properties() {
        let event = event_builders::mutation_failed(
            "task_x".to_string(),
            EntityType::Users,
            "HTTP 500: server exploded".to_string(),
        );

        assert_eq!(event.event_type(), "mutation_failed");
        assert_eq!(event.entity_type(), Some(EntityType::Users));
        assert_eq!(event.task_id(), Some("task_x"));
        assert!(event.timestamp() > 0);

        // 轮级失败事件不关联任何单条任务
        let pass_failed = event_builders::sync_pass_failed("KV store error: boom".to_string());
        assert_eq!(pass_failed.event_type(), "sync_pass_failed");
        assert_eq!(pass_failed.entity_type(), None);
        assert_eq!(pass_failed.task_id(), None);
    }
}
