//! 统一 SDK 接口 - EcoCartSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! EcoCartSDK (组合根)
//!   ├── ApiClient (HTTP 传输层：请求去重 + TTL 响应缓存)
//!   ├── StorageManager (存储管理层)
//!   ├── SyncConsumerRunner (离线变更同步层)
//!   ├── EventManager (事件系统层)
//!   └── NetworkMonitor (网络监控层)
//! ```
//!
//! 设计原则：
//! - 异步优先：主要 API 使用 async/await
//! - 显式装配：所有协作对象在初始化时构建并注入，网络监听器和
//!   冲突解决器都可由宿主替换，不依赖全局单例
//! - 分层清晰：每层职责明确，依赖关系清晰
//! - 事件驱动：统一的事件广播机制

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::api_client::{ApiClient, ApiClientConfig};
use crate::error::{EcoCartSDKError, Result};
use crate::events::{event_builders, EventFilter, EventManager, FilteredEventReceiver, SDKEvent};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusEvent, NetworkStatusListener};
use crate::storage::entities::{EntityPayload, EntityType};
use crate::storage::queue::{
    PersistentSyncQueue, QueuePriority, QueueStats, RetryManager, RetryPolicy, SyncAction,
    SyncConsumerConfig, SyncConsumerRunner, SyncQueueTrait, SyncReport, SyncTask,
};
use crate::storage::{KvStats, StorageManager};
use crate::sync::{ConflictResolver, ConflictStrategy};
use async_trait::async_trait;

/// 默认网络状态监听器（内部使用，假设网络始终在线）
/// 实际应用应该由平台层（Android/iOS/RN 宿主）提供真实的网络状态监听
#[derive(Debug)]
struct DefaultNetworkStatusListener {
    status: Arc<RwLock<NetworkStatus>>,
    sender: Arc<RwLock<Option<broadcast::Sender<NetworkStatusEvent>>>>,
}

impl Default for DefaultNetworkStatusListener {
    fn default() -> Self {
        Self {
            status: Arc::new(RwLock::new(NetworkStatus::Online)),
            sender: Arc::new(RwLock::new(None)),
        }
    }
}

#[async_trait]
impl NetworkStatusListener for DefaultNetworkStatusListener {
    async fn get_current_status(&self) -> NetworkStatus {
        *self.status.read().await
    }

    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
        let (sender, receiver) = broadcast::channel(100);
        {
            let mut sender_guard = self.sender.write().await;
            *sender_guard = Some(sender);
        }
        Ok(receiver)
    }

    async fn stop_monitoring(&self) {
        let mut sender_guard = self.sender.write().await;
        *sender_guard = None;
    }
}

/// EcoCart SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcoCartConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// REST API 基础 URL，例如 https://api.ecocart.app/v1
    pub api_base_url: String,
    /// Bearer 认证令牌
    pub auth_token: Option<String>,
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
    /// GET 响应缓存的默认 TTL（毫秒）
    pub cache_ttl_ms: u64,
    /// 重复 GET 请求的去重窗口（毫秒）
    pub dedup_window_ms: u64,
    /// 同步失败的重试策略
    pub retry_policy: RetryPolicy,
    /// 同步消费循环配置
    pub consumer_config: SyncConsumerConfig,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 内置冲突解决策略（注入自定义 ConflictResolver 时忽略）
    pub conflict_strategy: ConflictStrategy,
    /// 调试模式（安装调试级日志订阅器）
    pub debug_mode: bool,
}

impl Default for EcoCartConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            api_base_url: "http://localhost:3000/api".to_string(),
            auth_token: None,
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(30),
            cache_ttl_ms: 5 * 60 * 1000,
            dedup_window_ms: 5 * 1000,
            retry_policy: RetryPolicy::default(),
            consumer_config: SyncConsumerConfig::default(),
            event_buffer_size: 1000,
            conflict_strategy: ConflictStrategy::default(),
            debug_mode: false,
        }
    }
}

/// 获取默认数据目录 ~/.ecocart/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".ecocart")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        // Windows 支持
        home_dir.join(".ecocart")
    } else {
        // 如果无法获取用户主目录，则回退到当前目录
        PathBuf::from("./ecocart_data")
    }
}

/// EcoCart SDK 配置构建器
pub struct EcoCartConfigBuilder {
    config: EcoCartConfig,
}

impl EcoCartConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EcoCartConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = url.into();
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = Some(secs);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = Some(secs);
        self
    }

    pub fn cache_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.config.cache_ttl_ms = ttl_ms;
        self
    }

    pub fn dedup_window_ms(mut self, window_ms: u64) -> Self {
        self.config.dedup_window_ms = window_ms;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn consumer_config(mut self, config: SyncConsumerConfig) -> Self {
        self.config.consumer_config = config;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.config.conflict_strategy = strategy;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> EcoCartConfig {
        self.config
    }
}

impl Default for EcoCartConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 统一 SDK 主接口
///
/// 采用分层架构：
/// - 组合根：EcoCartSDK（当前类）
/// - HTTP 传输层：ApiClient（内部使用，带去重与缓存）
/// - 存储管理层：StorageManager
/// - 事件系统层：EventManager
/// - 同步消费层：SyncConsumerRunner
pub struct EcoCartSDK {
    /// SDK 配置
    config: EcoCartConfig,

    /// 存储管理器
    storage: Arc<StorageManager>,

    /// API 客户端（同时充当同步后端）
    api: Arc<ApiClient>,

    /// 离线变更队列（持久化，重启后恢复）
    queue: Arc<dyn SyncQueueTrait>,

    /// 同步消费循环
    consumer: Arc<SyncConsumerRunner>,

    /// 网络监控
    network: Arc<NetworkMonitor>,

    /// 事件管理器
    event_manager: Arc<EventManager>,

    /// 是否已初始化
    initialized: Arc<RwLock<bool>>,

    /// 是否正在关闭
    shutting_down: Arc<RwLock<bool>>,
}

impl EcoCartSDK {
    /// 异步初始化 SDK（推荐方式）
    ///
    /// 使用默认网络监听器（假设始终在线）和配置里的内置冲突策略。
    /// 需要接入平台真实网络状态或自定义冲突解决时用 [`initialize_with`](Self::initialize_with)。
    pub async fn initialize(config: EcoCartConfig) -> Result<Arc<Self>> {
        let listener = Arc::new(DefaultNetworkStatusListener::default());
        Self::initialize_with(config, listener, None).await
    }

    /// 异步初始化 SDK，显式注入网络监听器与冲突解决器
    ///
    /// 分层初始化顺序：
    /// 1. 存储层 → 2. 网络层 → 3. 事件层 → 4. 传输层 → 5. 队列层 → 6. 同步层
    pub async fn initialize_with(
        config: EcoCartConfig,
        network_listener: Arc<dyn NetworkStatusListener>,
        conflict_resolver: Option<Arc<dyn ConflictResolver>>,
    ) -> Result<Arc<Self>> {
        // 验证配置
        Self::validate_config(&config)?;

        if config.debug_mode {
            // 宿主可能已安装全局订阅器，重复初始化时静默跳过
            let _ = tracing_subscriber::fmt()
                .with_max_level(tracing::Level::DEBUG)
                .try_init();
        }

        info!("正在初始化 EcoCartSDK v{} ...", crate::version::SDK_VERSION);

        // === 第1层：存储管理器 ===
        let storage = Arc::new(StorageManager::new(&config.data_dir).await?);

        // === 第2层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(network_listener));
        network.start().await?;

        // === 第3层：事件管理器 ===
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));

        // 网络状态变化桥接进 SDK 事件流，宿主经 subscribe_events 观察连接变化
        {
            let mut network_events = network.subscribe();
            let bridge_events = event_manager.clone();
            tokio::spawn(async move {
                loop {
                    match network_events.recv().await {
                        Ok(change) => {
                            bridge_events
                                .emit(event_builders::network_status_changed(
                                    change.old_status,
                                    change.new_status,
                                ))
                                .await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("网络事件滞后，丢弃 {} 条", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        // === 第4层：API 客户端 ===
        let api = Arc::new(ApiClient::new(
            ApiClientConfig {
                base_url: config.api_base_url.clone(),
                auth_token: config.auth_token.clone(),
                connect_timeout_secs: config.connect_timeout_secs,
                request_timeout_secs: config.request_timeout_secs,
                default_cache_ttl_ms: config.cache_ttl_ms,
                dedup_window_ms: config.dedup_window_ms,
            },
            storage.kv(),
        )?);

        // === 第5层：持久化变更队列 ===
        let queue: Arc<dyn SyncQueueTrait> = Arc::new(PersistentSyncQueue::new(storage.kv()));
        let restored = queue.len().await?;
        if restored > 0 {
            info!("📥 已恢复离线变更队列: {} 条待同步", restored);
        }

        // === 第6层：同步消费循环 ===
        let resolver =
            conflict_resolver.unwrap_or_else(|| config.conflict_strategy.into_resolver());
        let retry_manager = Arc::new(RetryManager::new(config.retry_policy.clone()));
        let consumer = Arc::new(SyncConsumerRunner::new(
            config.consumer_config.clone(),
            queue.clone(),
            api.clone(),
            resolver,
            storage.clone(),
            network.clone(),
            retry_manager,
            event_manager.clone(),
        ));
        consumer.start().await?;

        let sdk = Arc::new(Self {
            config,
            storage,
            api,
            queue,
            consumer,
            network,
            event_manager,
            initialized: Arc::new(RwLock::new(true)),
            shutting_down: Arc::new(RwLock::new(false)),
        });

        // 重启前遗留的队列尽快消化
        if restored > 0 {
            sdk.consumer.request_sync();
        }

        info!("✅ EcoCartSDK 初始化完成");
        Ok(sdk)
    }

    fn validate_config(config: &EcoCartConfig) -> Result<()> {
        if config.api_base_url.is_empty() {
            return Err(EcoCartSDKError::Config("api_base_url 不能为空".to_string()));
        }
        if !config.api_base_url.starts_with("http://")
            && !config.api_base_url.starts_with("https://")
        {
            return Err(EcoCartSDKError::Config(format!(
                "api_base_url 必须以 http:// 或 https:// 开头: {}",
                config.api_base_url
            )));
        }
        if config.event_buffer_size == 0 {
            return Err(EcoCartSDKError::Config(
                "event_buffer_size 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    async fn ensure_active(&self) -> Result<()> {
        if *self.shutting_down.read().await {
            return Err(EcoCartSDKError::ShuttingDown);
        }
        if !*self.initialized.read().await {
            return Err(EcoCartSDKError::NotInitialized("SDK 已关闭".to_string()));
        }
        Ok(())
    }

    // ========== 变更入队 ==========

    /// 离线变更入队（核心方法）
    ///
    /// 流程：
    /// 1. 按动作推导默认优先级（可覆盖）
    /// 2. 持久化入队（应用被杀后重启仍在）
    /// 3. 立即返回任务ID
    /// 4. 在线时触发一轮同步（同步进行中则锁存到下一轮），离线则等网络恢复
    ///
    /// # 参数
    /// - `action`: 变更动作
    /// - `payload`: 类型化变更载荷
    /// - `record_id`: 目标记录ID（update / delete 必填）
    /// - `base_version`: 变更基于的服务端版本号（冲突检测用）
    /// - `priority`: 覆盖默认优先级（None 使用动作默认档位）
    ///
    /// # 返回
    /// - `Ok(String)`: 任务ID（用于跟踪 / 手动重试 / 丢弃）
    pub async fn queue_mutation(
        &self,
        action: SyncAction,
        payload: EntityPayload,
        record_id: Option<String>,
        base_version: Option<u64>,
        priority: Option<u8>,
    ) -> Result<String> {
        self.ensure_active().await?;

        let priority = priority.unwrap_or_else(|| QueuePriority::from_action(action).value());
        let task = SyncTask::new(
            action,
            payload,
            record_id,
            base_version,
            priority,
            self.config.retry_policy.max_retries,
        );
        let task_id = task.task_id.clone();
        let entity_type = task.entity_type();

        self.queue.push(task).await?;

        info!("📤 变更已入队: {} {} ({})", action, entity_type, task_id);
        self.event_manager
            .emit(event_builders::queue_item_added(
                task_id.clone(),
                entity_type,
                priority,
            ))
            .await;

        // 在线就踢一脚消费循环：Notify 许可会被锁存，正在跑的一轮
        // 结束后立即补跑；离线时等网络恢复事件
        if self.network.is_connected().await {
            self.consumer.request_sync();
        }

        Ok(task_id)
    }

    /// 入队一条新建变更
    pub async fn queue_create(&self, payload: EntityPayload) -> Result<String> {
        self.queue_mutation(SyncAction::Create, payload, None, None, None)
            .await
    }

    /// 入队一条更新变更（record_id 取自载荷）
    pub async fn queue_update(
        &self,
        payload: EntityPayload,
        base_version: Option<u64>,
    ) -> Result<String> {
        let record_id = payload.record_id().map(|s| s.to_string());
        self.queue_mutation(SyncAction::Update, payload, record_id, base_version, None)
            .await
    }

    /// 入队一条删除变更
    pub async fn queue_delete(
        &self,
        entity_type: EntityType,
        record_id: impl Into<String>,
        base_version: Option<u64>,
    ) -> Result<String> {
        let record_id = record_id.into();
        let payload = EntityPayload::reference(entity_type, &record_id);
        self.queue_mutation(
            SyncAction::Delete,
            payload,
            Some(record_id),
            base_version,
            None,
        )
        .await
    }

    // ========== 同步控制 ==========

    /// 执行一轮同步并等待结果
    ///
    /// 离线或已有同步在跑时返回空报告，不报错。
    pub async fn synchronize(&self) -> Result<SyncReport> {
        self.ensure_active().await?;
        Ok(self.consumer.synchronize().await)
    }

    /// 请求后台同步（非阻塞）
    pub fn request_sync(&self) {
        self.consumer.request_sync();
    }

    /// 待同步的变更条数
    pub async fn pending_count(&self) -> Result<usize> {
        self.queue.len().await
    }

    /// 队列统计信息
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// 终态失败的变更列表（宿主 UI 渲染「同步失败」页用）
    pub async fn failed_mutations(&self) -> Result<Vec<SyncTask>> {
        self.consumer.failed_tasks().await
    }

    /// 手动重试一条终态失败的变更
    pub async fn retry_mutation(&self, task_id: &str) -> Result<()> {
        self.ensure_active().await?;
        self.consumer.retry_task(task_id).await
    }

    /// 丢弃一条变更
    pub async fn discard_mutation(&self, task_id: &str) -> Result<()> {
        self.ensure_active().await?;
        self.consumer.discard_task(task_id).await
    }

    /// 清空整个变更队列，返回移除条数
    pub async fn clear_queue(&self) -> Result<usize> {
        self.ensure_active().await?;
        let removed = self.queue.clear().await?;
        info!("🧹 变更队列已清空: {} 条", removed);
        self.event_manager
            .emit(event_builders::queue_cleared(removed))
            .await;
        Ok(removed)
    }

    // ========== 同步状态 ==========

    /// 累计成功同步的变更条数
    pub async fn sync_completed_count(&self) -> Result<i64> {
        self.storage.sync_completed_count().await
    }

    /// 最近一次成功走完同步的时间（毫秒时间戳）
    pub async fn last_sync_at(&self) -> Result<Option<u64>> {
        self.storage.last_sync_at().await
    }

    /// 最近一次轮级同步错误（成功走完一轮后清除）
    pub async fn last_sync_error(&self) -> Option<String> {
        self.consumer.last_sync_error().await
    }

    /// 是否正有一轮同步在跑
    pub fn is_syncing(&self) -> bool {
        self.consumer.is_syncing()
    }

    // ========== 缓存与网络 ==========

    /// 清空全部 API 响应缓存，返回清除条数
    pub async fn clear_cache(&self) -> Result<u64> {
        self.ensure_active().await?;
        let removed = self.api.clear_cache().await?;
        self.event_manager
            .emit(event_builders::cache_cleared(removed))
            .await;
        Ok(removed)
    }

    /// 清理已过期的缓存条目（低频维护任务）
    pub async fn purge_expired_cache(&self) -> Result<u64> {
        self.ensure_active().await?;
        self.storage.purge_expired_cache().await
    }

    /// 取消所有在途请求，返回取消数量
    pub async fn cancel_all_requests(&self, reason: &str) -> Result<usize> {
        self.ensure_active().await?;
        Ok(self.api.cancel_all_requests(reason))
    }

    /// 当前网络状态
    pub async fn network_status(&self) -> NetworkStatus {
        self.network.get_status().await
    }

    /// 宿主桥接平台网络状态变化（RN NetInfo / Android ConnectivityManager 等）
    pub async fn set_network_status(&self, status: NetworkStatus) {
        self.network.set_status(status).await;
    }

    /// 网络是否可用
    pub async fn is_connected(&self) -> bool {
        self.network.is_connected().await
    }

    // ========== 事件与访问器 ==========

    /// 订阅全量 SDK 事件
    pub async fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.event_manager.subscribe().await
    }

    /// 订阅过滤后的 SDK 事件
    pub async fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter).await
    }

    /// API 客户端（带去重与缓存的 HTTP 访问入口）
    pub fn api(&self) -> Arc<ApiClient> {
        self.api.clone()
    }

    /// 存储管理器
    pub fn storage(&self) -> Arc<StorageManager> {
        self.storage.clone()
    }

    /// 事件管理器
    pub fn event_manager(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }

    /// 存储统计信息
    pub async fn storage_stats(&self) -> Result<KvStats> {
        self.storage.stats().await
    }

    /// 当前生效的配置
    pub fn config(&self) -> &EcoCartConfig {
        &self.config
    }

    /// SDK 版本号
    pub fn version(&self) -> &'static str {
        crate::version::SDK_VERSION
    }

    // ========== 生命周期 ==========

    /// 检查 SDK 是否已初始化
    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await
    }

    /// 检查 SDK 是否正在关闭
    pub async fn is_shutting_down(&self) -> bool {
        *self.shutting_down.read().await
    }

    /// 关闭 SDK
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 EcoCartSDK...");

        // 设置关闭标志（重复关闭是空操作）
        {
            let mut shutting_down = self.shutting_down.write().await;
            if *shutting_down {
                return Ok(());
            }
            *shutting_down = true;
        }

        // 1. 停止同步消费循环
        self.consumer.stop().await?;

        // 2. 停止网络监控
        self.network.stop().await;

        // 3. 取消在途请求
        let cancelled = self.api.cancel_all_requests("SDK 关停");
        if cancelled > 0 {
            warn!("关停时取消了 {} 个在途请求", cancelled);
        }

        // 4. 存储落盘（队列和计数器都在 KV 里）
        self.storage.flush().await?;

        {
            let mut initialized = self.initialized.write().await;
            *initialized = false;
        }

        info!("EcoCartSDK 关闭完成");
        Ok(())
    }
}
