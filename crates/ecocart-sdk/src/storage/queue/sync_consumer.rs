//! 同步消费循环 - 把离线变更队列回放到 REST 后端
//!
//! 离线变更回放必须严格串行：同一记录的 create → update → delete
//! 乱序会产生脏数据。因此这里只有一条驱动循环，单飞标志保证任意
//! 时刻至多一轮同步在跑。
//!
//! 一轮同步的流程：
//! 1. 快照当前队列并按优先级降序排列（处理期间的新入队等下一轮）
//! 2. 逐条处理：退避未到期的跳过，其余按动作分发到远端
//! 3. 更新/删除前先拉取服务端版本做冲突检测，冲突交给解决策略
//! 4. 成功移除并累加完成计数；失败按原因排期重试或转入终态

use crate::error::{EcoCartSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::network::NetworkMonitor;
use crate::storage::queue::retry_policy::{RetryManager, SyncFailureReason};
use crate::storage::queue::sync_task::{SyncAction, SyncTask, TaskStatus};
use crate::storage::queue::SyncQueueTrait;
use crate::storage::StorageManager;
use crate::sync::{ConflictData, ConflictKind, ConflictResolver, SyncBackend};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::broadcast;
use tokio::sync::{Notify, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// 同步消费者配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConsumerConfig {
    /// 周期轮询间隔（毫秒），兜底捞起退避到期的任务
    pub poll_interval_ms: u64,
    /// 单条变更的处理超时（秒）
    pub item_timeout_seconds: u64,
}

impl Default for SyncConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 30_000,
            item_timeout_seconds: 30,
        }
    }
}

/// 同步统计信息
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub sync_pass_total: u64,
    pub attempt_total: u64,
    pub success_total: u64,
    pub failure_total: u64,
    pub conflict_total: u64,
    pub retry_total: u64,
}

impl SyncMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.attempt_total == 0 {
            0.0
        } else {
            self.success_total as f64 / self.attempt_total as f64
        }
    }
}

/// 单轮同步结果
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// 本轮实际尝试的任务数
    pub attempted: usize,
    pub succeeded: usize,
    /// 转入终态失败的任务数
    pub failed: usize,
    pub conflicts_resolved: usize,
    /// 排期了下次重试的任务数
    pub rescheduled: usize,
    /// 退避未到期被跳过的任务数
    pub skipped_backoff: usize,
    /// 轮级错误（读队列失败等），单条任务失败不计入
    pub error: Option<String>,
    pub started_at: u64,
    pub finished_at: u64,
}

/// 同步消费者运行器
#[derive(Clone)]
pub struct SyncConsumerRunner {
    config: SyncConsumerConfig,
    queue: Arc<dyn SyncQueueTrait>,
    backend: Arc<dyn SyncBackend>,
    resolver: Arc<dyn ConflictResolver>,
    storage: Arc<StorageManager>,
    network_monitor: Arc<NetworkMonitor>,
    retry_manager: Arc<RetryManager>,
    event_manager: Arc<EventManager>,

    // 统计信息
    metrics: Arc<RwLock<SyncMetrics>>,

    // 单飞标志：任意时刻至多一轮同步
    is_syncing: Arc<AtomicBool>,
    // 最近一次轮级错误
    last_sync_error: Arc<RwLock<Option<String>>>,

    // 控制信号
    shutdown_signal: Arc<Notify>,
    sync_kick: Arc<Notify>,
    is_running: Arc<RwLock<bool>>,
}

impl SyncConsumerRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConsumerConfig,
        queue: Arc<dyn SyncQueueTrait>,
        backend: Arc<dyn SyncBackend>,
        resolver: Arc<dyn ConflictResolver>,
        storage: Arc<StorageManager>,
        network_monitor: Arc<NetworkMonitor>,
        retry_manager: Arc<RetryManager>,
        event_manager: Arc<EventManager>,
    ) -> Self {
        Self {
            config,
            queue,
            backend,
            resolver,
            storage,
            network_monitor,
            retry_manager,
            event_manager,
            metrics: Arc::new(RwLock::new(SyncMetrics::default())),
            is_syncing: Arc::new(AtomicBool::new(false)),
            last_sync_error: Arc::new(RwLock::new(None)),
            shutdown_signal: Arc::new(Notify::new()),
            sync_kick: Arc::new(Notify::new()),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    fn empty_report() -> SyncReport {
        let now = Self::now_ms();
        SyncReport {
            started_at: now,
            finished_at: now,
            ..Default::default()
        }
    }

    /// 启动驱动循环：监听手动触发、网络恢复和周期轮询
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(EcoCartSDKError::InvalidOperation(
                    "Sync consumer already running".to_string(),
                ));
            }
            *running = true;
        }

        info!(
            "启动同步消费循环 (poll every {}ms, item timeout {}s)",
            self.config.poll_interval_ms, self.config.item_timeout_seconds
        );

        let consumer = self.clone();
        let mut network_events = self.network_monitor.subscribe();

        tokio::spawn(async move {
            info!("同步驱动循环已启动");

            loop {
                select! {
                    _ = consumer.shutdown_signal.notified() => {
                        info!("同步驱动循环收到关停信号");
                        break;
                    }
                    _ = consumer.sync_kick.notified() => {
                        consumer.synchronize().await;
                    }
                    event = network_events.recv() => {
                        match event {
                            Ok(event) if event.came_online() => {
                                info!("📶 网络恢复，触发积压同步");
                                consumer.synchronize().await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("网络事件滞后，丢弃 {} 条", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = sleep(Duration::from_millis(consumer.config.poll_interval_ms)) => {
                        if !*consumer.is_running.read().await {
                            break;
                        }
                        consumer.synchronize().await;
                    }
                }
            }

            info!("同步驱动循环已退出");
        });

        Ok(())
    }

    /// 停止消费者
    pub async fn stop(&self) -> Result<()> {
        info!("停止同步消费循环");

        {
            let mut running = self.is_running.write().await;
            *running = false;
        }

        self.shutdown_signal.notify_waiters();

        // 给驱动循环留出退出时间
        sleep(Duration::from_millis(100)).await;

        info!("同步消费循环已停止");
        Ok(())
    }

    /// 请求一次同步（非阻塞；若当前正有一轮在跑，许可会被锁存到下一轮）
    pub fn request_sync(&self) {
        self.sync_kick.notify_one();
    }

    /// 执行一轮同步
    ///
    /// 离线、已有同步在跑、队列为空时都是安全的空操作。
    pub async fn synchronize(&self) -> SyncReport {
        if !self.network_monitor.is_connected().await {
            debug!("网络不可用，跳过同步");
            return Self::empty_report();
        }

        // 单飞保护
        if self.is_syncing.swap(true, Ordering::SeqCst) {
            debug!("同步已在进行中，跳过重复触发");
            return Self::empty_report();
        }

        let report = self.run_pass().await;
        self.is_syncing.store(false, Ordering::SeqCst);
        report
    }

    async fn run_pass(&self) -> SyncReport {
        let mut report = SyncReport {
            started_at: Self::now_ms(),
            ..Default::default()
        };

        // 1. 快照当前队列（本轮只处理快照内的任务）
        let tasks = match self.queue.snapshot_sorted().await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!("读取同步队列失败: {}", e);
                let msg = e.to_string();
                *self.last_sync_error.write().await = Some(msg.clone());
                self.event_manager
                    .emit(event_builders::sync_pass_failed(msg.clone()))
                    .await;
                report.error = Some(msg);
                report.finished_at = Self::now_ms();
                return report;
            }
        };

        let pending: Vec<SyncTask> = tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && t.retry_count < t.max_retries)
            .collect();

        if pending.is_empty() {
            debug!("同步队列为空，本轮跳过");
            report.finished_at = Self::now_ms();
            return report;
        }

        info!("📤 开始同步: {} 条待处理变更", pending.len());
        self.event_manager
            .emit(event_builders::sync_started(pending.len()))
            .await;
        {
            let mut m = self.metrics.write().await;
            m.sync_pass_total += 1;
        }

        // 2. 逐条串行处理
        for mut task in pending {
            if !task.is_due() {
                debug!(
                    "任务 {} 退避未到期，剩余 {:?}ms",
                    task.task_id,
                    task.remaining_retry_ms()
                );
                report.skipped_backoff += 1;
                continue;
            }

            report.attempted += 1;
            {
                let mut m = self.metrics.write().await;
                m.attempt_total += 1;
            }

            task.mark_processing();
            debug!("处理任务: {}", task.details());

            let outcome = timeout(
                Duration::from_secs(self.config.item_timeout_seconds),
                self.process_task(&task),
            )
            .await;

            match outcome {
                Ok(Ok(conflict)) => {
                    self.finish_task(&task, conflict, &mut report).await;
                }
                Ok(Err(e)) => {
                    self.handle_task_failure(task, e, &mut report).await;
                }
                Err(_) => {
                    let e = EcoCartSDKError::timeout(format!(
                        "同步超时 ({}s): {}",
                        self.config.item_timeout_seconds, task.task_id
                    ));
                    self.handle_task_failure(task, e, &mut report).await;
                }
            }
        }

        // 3. 收尾：记录同步时间，清除轮级错误
        if let Err(e) = self.storage.set_last_sync_at(Self::now_ms()).await {
            warn!("记录同步时间失败: {}", e);
        }
        *self.last_sync_error.write().await = None;

        info!(
            "✅ 同步完成: 尝试 {} 成功 {} 终态失败 {} 重试排期 {} 冲突 {}",
            report.attempted,
            report.succeeded,
            report.failed,
            report.rescheduled,
            report.conflicts_resolved
        );
        self.event_manager
            .emit(event_builders::sync_pass_completed(
                report.attempted,
                report.succeeded,
                report.failed,
                report.conflicts_resolved,
            ))
            .await;

        report.finished_at = Self::now_ms();
        report
    }

    /// 任务成功收尾：出队、累加计数、发事件
    ///
    /// 这里的队列/存储错误只记日志，不中断本轮其余任务。
    async fn finish_task(
        &self,
        task: &SyncTask,
        conflict: Option<ConflictKind>,
        report: &mut SyncReport,
    ) {
        if let Err(e) = self.queue.remove(&task.task_id).await {
            error!("移除已完成任务失败 {}: {}", task.task_id, e);
        }
        if let Err(e) = self.storage.increment_sync_completed().await {
            warn!("累加同步完成计数失败: {}", e);
        }

        report.succeeded += 1;
        {
            let mut m = self.metrics.write().await;
            m.success_total += 1;
            if conflict.is_some() {
                m.conflict_total += 1;
            }
        }

        if let Some(kind) = conflict {
            report.conflicts_resolved += 1;
            info!("🔀 冲突已解决: {} ({})", task.task_id, kind);
            self.event_manager
                .emit(event_builders::conflict_resolved(
                    task.task_id.clone(),
                    task.entity_type(),
                    kind,
                ))
                .await;
        }

        self.event_manager
            .emit(event_builders::mutation_synced(
                task.task_id.clone(),
                task.entity_type(),
                task.action,
            ))
            .await;
    }

    /// 任务失败处理：按失败原因排期重试或转入终态
    async fn handle_task_failure(
        &self,
        mut task: SyncTask,
        error: EcoCartSDKError,
        report: &mut SyncReport,
    ) {
        let reason = SyncFailureReason::from(&error);
        warn!("❌ 同步失败 {}: {:?} ({})", task.task_id, reason, error);

        {
            let mut m = self.metrics.write().await;
            m.failure_total += 1;
        }

        // 本次失败计入尝试数，额度与退避都按累加后的计数决策
        task.increment_retry();

        match self.retry_manager.handle_sync_failure(task.retry_count, &reason) {
            Ok(Some(next_retry_at)) => {
                task.schedule_retry(next_retry_at);
                task.last_error = Some(error.to_string());
                task.last_failure_reason = Some(reason);

                info!(
                    "🔁 排期重试 {}: 第 {} 次，{}ms 后",
                    task.task_id,
                    task.retry_count,
                    next_retry_at.saturating_sub(Self::now_ms())
                );
                self.event_manager
                    .emit(event_builders::mutation_retry_scheduled(
                        task.task_id.clone(),
                        task.retry_count,
                        next_retry_at,
                    ))
                    .await;

                if let Err(e) = self.queue.push(task).await {
                    error!("回写重试任务失败: {}", e);
                }
                report.rescheduled += 1;
                let mut m = self.metrics.write().await;
                m.retry_total += 1;
            }
            Ok(None) => {
                task.mark_failed(error.to_string(), Some(reason));
                error!(
                    "⛔ 任务转入终态失败 {}: 等待手动重试或丢弃",
                    task.task_id
                );
                self.event_manager
                    .emit(event_builders::mutation_failed(
                        task.task_id.clone(),
                        task.entity_type(),
                        error.to_string(),
                    ))
                    .await;

                if let Err(e) = self.queue.push(task).await {
                    error!("回写终态任务失败: {}", e);
                }
                report.failed += 1;
            }
            Err(e) => {
                error!("重试决策失败 {}: {}", task.task_id, e);
                report.failed += 1;
            }
        }
    }

    /// 按动作分发单个任务
    async fn process_task(&self, task: &SyncTask) -> Result<Option<ConflictKind>> {
        match task.action {
            SyncAction::Create => self.handle_create(task).await,
            SyncAction::Update => self.handle_update(task).await,
            SyncAction::Delete => self.handle_delete(task).await,
        }
    }

    async fn handle_create(&self, task: &SyncTask) -> Result<Option<ConflictKind>> {
        let body = task.data.to_value()?;
        self.backend.create_record(&task.endpoint, &body).await?;
        Ok(None)
    }

    async fn handle_update(&self, task: &SyncTask) -> Result<Option<ConflictKind>> {
        let record_id = Self::required_record_id(task)?;
        let body = task.data.to_value()?;

        // 更新前拉取服务端当前版本做冲突检测
        let remote = self.backend.fetch_record(&task.endpoint, record_id).await?;

        match remote {
            None => {
                // 更新目标已被其他端删除
                let conflict = ConflictData {
                    kind: ConflictKind::RemoteMissing,
                    record_id: record_id.to_string(),
                    local_data: body,
                    local_timestamp: task.created_at,
                    remote_data: None,
                    remote_timestamp: None,
                };
                let resolution = self
                    .resolver
                    .resolve_conflict(&conflict, task.entity_type())
                    .await?;

                if resolution.should_delete {
                    debug!("冲突解决: 接受远端删除 {}", record_id);
                } else if let Some(resolved) = resolution.resolved_data {
                    // 重建被删除的记录
                    self.backend.create_record(&task.endpoint, &resolved).await?;
                }
                Ok(Some(ConflictKind::RemoteMissing))
            }
            Some(remote) => {
                let version_mismatch = task
                    .base_version
                    .map_or(false, |base| remote.version != base);

                if version_mismatch {
                    let conflict = ConflictData {
                        kind: ConflictKind::BothModified,
                        record_id: record_id.to_string(),
                        local_data: body,
                        local_timestamp: task.created_at,
                        remote_data: Some(remote.data),
                        remote_timestamp: Some(remote.updated_at),
                    };
                    let resolution = self
                        .resolver
                        .resolve_conflict(&conflict, task.entity_type())
                        .await?;

                    if resolution.should_delete {
                        self.backend.delete_record(&task.endpoint, record_id).await?;
                    } else if let Some(resolved) = resolution.resolved_data {
                        self.backend
                            .update_record(&task.endpoint, record_id, &resolved)
                            .await?;
                    }
                    // 两者皆无：放弃本地变更，保留远端
                    Ok(Some(ConflictKind::BothModified))
                } else {
                    self.backend
                        .update_record(&task.endpoint, record_id, &body)
                        .await?;
                    Ok(None)
                }
            }
        }
    }

    async fn handle_delete(&self, task: &SyncTask) -> Result<Option<ConflictKind>> {
        let record_id = Self::required_record_id(task)?;

        let remote = self.backend.fetch_record(&task.endpoint, record_id).await?;

        match remote {
            // 记录已不存在，删除幂等成功
            None => Ok(None),
            Some(remote) => {
                let version_mismatch = task
                    .base_version
                    .map_or(false, |base| remote.version != base);

                if version_mismatch {
                    // 删除时远端已被其他端更新
                    let conflict = ConflictData {
                        kind: ConflictKind::StaleDelete,
                        record_id: record_id.to_string(),
                        local_data: task.data.to_value()?,
                        local_timestamp: task.created_at,
                        remote_data: Some(remote.data),
                        remote_timestamp: Some(remote.updated_at),
                    };
                    let resolution = self
                        .resolver
                        .resolve_conflict(&conflict, task.entity_type())
                        .await?;

                    if resolution.should_delete {
                        self.backend.delete_record(&task.endpoint, record_id).await?;
                    } else if let Some(resolved) = resolution.resolved_data {
                        // 放弃删除，把远端意图写回
                        self.backend
                            .update_record(&task.endpoint, record_id, &resolved)
                            .await?;
                    }
                    Ok(Some(ConflictKind::StaleDelete))
                } else {
                    self.backend.delete_record(&task.endpoint, record_id).await?;
                    Ok(None)
                }
            }
        }
    }

    fn required_record_id(task: &SyncTask) -> Result<&str> {
        task.record_id.as_deref().ok_or_else(|| {
            EcoCartSDKError::invalid_input(format!(
                "{} 任务缺少 record_id: {}",
                task.action, task.task_id
            ))
        })
    }

    /// 手动重试一个终态失败的任务：清零计数并立即触发同步
    pub async fn retry_task(&self, task_id: &str) -> Result<()> {
        let mut task = self
            .queue
            .get(task_id)
            .await?
            .ok_or_else(|| EcoCartSDKError::not_found(format!("任务不存在: {}", task_id)))?;

        if task.status != TaskStatus::Failed {
            return Err(EcoCartSDKError::InvalidOperation(format!(
                "任务不在终态失败，无法手动重试: {} ({})",
                task_id, task.status
            )));
        }

        task.reset_for_retry();
        self.queue.push(task).await?;
        info!("🔄 手动重试任务: {}", task_id);
        self.sync_kick.notify_one();
        Ok(())
    }

    /// 丢弃一个任务（终态失败或不再需要的变更）
    pub async fn discard_task(&self, task_id: &str) -> Result<()> {
        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or_else(|| EcoCartSDKError::not_found(format!("任务不存在: {}", task_id)))?;

        self.queue.remove(task_id).await?;
        info!("🗑️ 已丢弃任务: {}", task.details());
        Ok(())
    }

    /// 终态失败的任务列表（宿主 UI 渲染用）
    pub async fn failed_tasks(&self) -> Result<Vec<SyncTask>> {
        self.queue.failed_tasks().await
    }

    /// 获取统计信息
    pub async fn get_metrics(&self) -> SyncMetrics {
        self.metrics.read().await.clone()
    }

    /// 清除统计信息
    pub async fn clear_metrics(&self) {
        let mut metrics = self.metrics.write().await;
        *metrics = SyncMetrics::default();
    }

    /// 是否正有一轮同步在跑
    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::SeqCst)
    }

    /// 最近一次轮级错误（成功走完一轮后清除）
    pub async fn last_sync_error(&self) -> Option<String> {
        self.last_sync_error.read().await.clone()
    }

    /// 检查驱动循环是否在运行
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }
}
