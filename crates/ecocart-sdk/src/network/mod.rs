//! 网络状态监控
//!
//! SDK 本身不探测网络：宿主平台（iOS/Android/桌面壳）注入
//! NetworkStatusListener，NetworkMonitor 负责聚合状态、
//! 去掉无效转换并广播给同步循环做门控。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::Result;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限（按在线处理，但宿主可据此降级）
    Limited,
}

impl NetworkStatus {
    /// 该状态下是否允许发起网络请求
    pub fn is_connected(self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    /// 变化时间（毫秒时间戳）
    pub timestamp: u64,
}

impl NetworkStatusEvent {
    /// 是否从不可用恢复为可用（同步循环据此补跑积压队列）
    pub fn came_online(&self) -> bool {
        !self.old_status.is_connected() && self.new_status.is_connected()
    }
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Arc<dyn NetworkStatusListener>,
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn NetworkStatusListener>) -> Self {
        let (status_sender, _) = broadcast::channel(100);

        Self {
            listener,
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(NetworkStatus::Offline)),
        }
    }

    /// 启动网络监控：拉取初始状态并转发监听器事件
    pub async fn start(&self) -> Result<()> {
        {
            let mut status = self.current_status.write().await;
            *status = self.listener.get_current_status().await;
        }

        let mut receiver = self.listener.start_monitoring().await?;
        let status_sender = self.status_sender.clone();
        let current_status = self.current_status.clone();

        // 启动监听任务
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                // 更新当前状态
                {
                    let mut status = current_status.write().await;
                    *status = event.new_status;
                }

                // 广播状态变化
                let _ = status_sender.send(event);
            }
        });

        Ok(())
    }

    /// 停止监听（关停时调用）
    pub async fn stop(&self) {
        self.listener.stop_monitoring().await;
    }

    /// 获取当前网络状态
    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    /// 手动设置网络状态（宿主平台回调或测试驱动）
    ///
    /// 同状态重复设置不广播，避免同步循环被空转换反复唤醒。
    pub async fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            if old == new_status {
                return;
            }
            *status = new_status;
            old
        };

        // 广播状态变化
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis() as u64,
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 当前是否可发起网络请求
    pub async fn is_connected(&self) -> bool {
        self.get_status().await.is_connected()
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用：状态可手动驱动的网络监听器
    #[derive(Debug)]
    pub struct DummyNetworkStatusListener {
        status: Arc<tokio::sync::RwLock<NetworkStatus>>,
        sender: Arc<tokio::sync::RwLock<Option<broadcast::Sender<NetworkStatusEvent>>>>,
    }

    impl Default for DummyNetworkStatusListener {
        fn default() -> Self {
            Self::with_status(NetworkStatus::Online)
        }
    }

    impl DummyNetworkStatusListener {
        pub fn with_status(status: NetworkStatus) -> Self {
            Self {
                status: Arc::new(tokio::sync::RwLock::new(status)),
                sender: Arc::new(tokio::sync::RwLock::new(None)),
            }
        }

        /// 模拟平台网络状态变化
        pub async fn transition_to(&self, new_status: NetworkStatus) {
            let old_status = {
                let mut status = self.status.write().await;
                let old = *status;
                *status = new_status;
                old
            };
            if let Some(tx) = self.sender.read().await.as_ref() {
                let _ = tx.send(NetworkStatusEvent {
                    old_status,
                    new_status,
                    timestamp: chrono::Utc::now().timestamp_millis() as u64,
                });
            }
        }
    }

    #[async_trait::async_trait]
    impl NetworkStatusListener for DummyNetworkStatusListener {
        async fn get_current_status(&self) -> NetworkStatus {
            *self.status.read().await
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>> {
            let (tx, rx) = broadcast::channel(16);
            *self.sender.write().await = Some(tx);
            Ok(rx)
        }

        async fn stop_monitoring(&self) {
            *self.sender.write().await = None;
        }
    }
}

#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_status_offline_until_started() {
        let monitor = NetworkMonitor::new(Arc::new(DummyNetworkStatusListener::default()));
        assert_eq!(monitor.get_status().await, NetworkStatus::Offline);
        assert!(!monitor.is_connected().await);
    }

    #[tokio::test]
    async fn test_start_adopts_listener_status_and_forwards_events() {
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let monitor = NetworkMonitor::new(listener.clone());
        let mut rx = monitor.subscribe();

        monitor.start().await.unwrap();
        assert_eq!(monitor.get_status().await, NetworkStatus::Online);

        listener.transition_to(NetworkStatus::Offline).await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new_status, NetworkStatus::Offline);
        assert!(!event.came_online());
        assert_eq!(monitor.get_status().await, NetworkStatus::Offline);

        listener.transition_to(NetworkStatus::Online).await;
        let event = rx.recv().await.unwrap();
        assert!(event.came_online());
    }

    #[tokio::test]
    async fn test_set_status_suppresses_noop_transitions() {
        let monitor = NetworkMonitor::new(Arc::new(DummyNetworkStatusListener::default()));
        let mut rx = monitor.subscribe();

        monitor.set_status(NetworkStatus::Online).await;
        monitor.set_status(NetworkStatus::Online).await;
        monitor.set_status(NetworkStatus::Limited).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.new_status, NetworkStatus::Online);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.new_status, NetworkStatus::Limited);
        assert!(rx.try_recv().is_err());
    }
}
