//! EcoCart SDK - 回收预约应用的离线优先数据层
//!
//! 本 SDK 提供了完整的离线优先能力，包括：
//! - 📤 离线变更队列：断网时入队，网络恢复后按优先级自动回放
//! - 📡 网络状态监控和指数退避重试
//! - 🔀 冲突检测与可插拔的冲突解决策略
//! - 📦 GET 响应 TTL 缓存与重复请求去重
//! - ⚙️ 事件系统：统一的事件广播和回调机制
//! - 💾 数据持久化：sled 嵌入式 KV 存储，应用被杀后队列不丢
//! - 🧵 并发安全：异步优先设计，支持多线程
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use ecocart_sdk::{CollectionRecord, EcoCartConfigBuilder, EcoCartSDK, EntityPayload};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 配置 SDK
//!     let config = EcoCartConfigBuilder::new()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.ecocart.app/v1")
//!         .auth_token("token_123")
//!         .build();
//!
//!     // 初始化 SDK
//!     let sdk = EcoCartSDK::initialize(config).await?;
//!
//!     // 离线入队一条新建预约，网络可用时自动同步
//!     let task_id = sdk
//!         .queue_create(EntityPayload::Collection(CollectionRecord {
//!             address: Some("12 Green Lane".to_string()),
//!             ..Default::default()
//!         }))
//!         .await?;
//!     println!("变更已入队: {}", task_id);
//!
//!     // 手动触发一轮同步并查看结果
//!     let report = sdk.synchronize().await?;
//!     println!("成功 {} 条，终态失败 {} 条", report.succeeded, report.failed);
//!
//!     // 关闭 SDK
//!     sdk.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod api_client;
pub mod error;
pub mod events;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{EcoCartSDKError, Result};
pub use sdk::{EcoCartConfig, EcoCartConfigBuilder, EcoCartSDK};
pub use api_client::{ApiClient, ApiClientConfig, ApiResponse, RequestOptions};
pub use events::{EventFilter, EventManager, EventStats, FilteredEventReceiver, SDKEvent};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
pub use storage::entities::{
    CollectionRecord, EntityPayload, EntityType, MaterialRecord, UserRecord,
};
pub use storage::queue::{
    MemorySyncQueue, PersistentSyncQueue, QueuePriority, QueueStats, RetryPolicy, SyncAction,
    SyncConsumerConfig, SyncMetrics, SyncQueueTrait, SyncReport, SyncTask, TaskStatus,
};
pub use storage::{KvStore, StorageManager};
pub use sync::{
    ConflictData, ConflictKind, ConflictResolution, ConflictResolver, ConflictStrategy,
    RemoteRecord, SyncBackend,
};
pub use version::SDK_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!SDK_VERSION.is_empty());
        assert!(SDK_VERSION.contains('.'));

        println!("✅ 版本号测试通过: {}", SDK_VERSION);
    }

    #[test]
    fn test_default_config_is_usable() {
        let config = EcoCartConfig::default();

        assert!(config.api_base_url.starts_with("http"));
        assert_eq!(config.cache_ttl_ms, 5 * 60 * 1000);
        assert_eq!(config.dedup_window_ms, 5 * 1000);
        assert_eq!(config.retry_policy.max_retries, 3);
        assert_eq!(config.conflict_strategy, ConflictStrategy::LastWriteWins);
        assert!(!config.debug_mode);

        println!("✅ 默认配置测试通过");
    }

    #[test]
    fn test_priority_defaults_by_action() {
        // 删除 > 更新 > 新建：越接近用户意图立刻生效的动作越先上行
        assert!(
            QueuePriority::from_action(SyncAction::Delete).value()
                > QueuePriority::from_action(SyncAction::Update).value()
        );
        assert!(
            QueuePriority::from_action(SyncAction::Update).value()
                > QueuePriority::from_action(SyncAction::Create).value()
        );

        println!("✅ 动作默认优先级测试通过");
    }
}
