/// 离线变更同步模块
/// 职责：
/// - 定义队列消费侧依赖的远端读写接口（SyncBackend）
/// - 提供冲突检测数据结构与可插拔解决策略（conflict）
///
/// 消费循环只面向这两个接口编程：生产环境由 ApiClient 提供
/// SyncBackend 实现，测试用内存桩替换。
pub mod conflict;

pub use conflict::{
    ConflictData, ConflictKind, ConflictResolution, ConflictResolver, ConflictStrategy,
    LastWriteWins, PreferLocal, PreferRemote,
};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 远端记录的冲突检测视角：版本号 + 修改时间 + 完整数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    /// 服务端乐观锁版本号
    pub version: u64,
    /// 服务端最后修改时间（毫秒时间戳）
    pub updated_at: u64,
    /// 完整记录 JSON
    pub data: serde_json::Value,
}

impl RemoteRecord {
    /// 从响应 JSON 提取记录元信息，缺失字段取默认值
    pub fn from_value(body: serde_json::Value) -> Self {
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let version = body.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
        let updated_at = body
            .get("updated_at")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis() as u64);
        Self {
            id,
            version,
            updated_at,
            data: body,
        }
    }
}

/// 队列消费侧依赖的远端接口
#[async_trait::async_trait]
pub trait SyncBackend: Send + Sync + std::fmt::Debug {
    /// 拉取单条记录的服务端当前状态，记录不存在时返回 None
    async fn fetch_record(&self, endpoint: &str, record_id: &str)
        -> Result<Option<RemoteRecord>>;

    /// 创建记录
    async fn create_record(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<RemoteRecord>;

    /// 整体覆盖更新记录
    async fn update_record(
        &self,
        endpoint: &str,
        record_id: &str,
        body: &serde_json::Value,
    ) -> Result<RemoteRecord>;

    /// 删除记录（对已不存在的记录幂等）
    async fn delete_record(&self, endpoint: &str, record_id: &str) -> Result<()>;
}
