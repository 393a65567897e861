//! 冲突检测数据与可插拔解决策略
//!
//! 队列消费侧把冲突视为不透明策略调用：构造 ConflictData，
//! 交给 ConflictResolver，按返回的 ConflictResolution 执行。
//! 内置三种策略，宿主可在组装根注入自定义实现。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::entities::EntityType;

/// 冲突类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// 双方都改过：本地变更的基线版本落后于服务端当前版本
    BothModified,
    /// 远端记录已不存在：更新目标被其他端删除
    RemoteMissing,
    /// 过期删除：删除时远端版本已被其他端更新
    StaleDelete,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BothModified => "both_modified",
            Self::RemoteMissing => "remote_missing",
            Self::StaleDelete => "stale_delete",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 冲突数据 - 仅在同步过程中瞬时构建，从不持久化
#[derive(Debug, Clone)]
pub struct ConflictData {
    pub kind: ConflictKind,
    /// 冲突记录ID
    pub record_id: String,
    /// 本地变更载荷
    pub local_data: serde_json::Value,
    /// 本地变更入队时间（毫秒时间戳）
    pub local_timestamp: u64,
    /// 服务端当前记录（RemoteMissing 时为 None）
    pub remote_data: Option<serde_json::Value>,
    /// 服务端最后修改时间（毫秒时间戳）
    pub remote_timestamp: Option<u64>,
}

/// 冲突解决结果
///
/// - `should_delete = true`：记录不应存在（执行/接受删除）
/// - `resolved_data = Some(..)`：把该数据写回服务端（更新或重建）
/// - 两者皆无：放弃本地变更，保留远端现状
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConflictResolution {
    pub should_delete: bool,
    pub resolved_data: Option<serde_json::Value>,
}

impl ConflictResolution {
    /// 按删除处理
    pub fn delete() -> Self {
        Self {
            should_delete: true,
            resolved_data: None,
        }
    }

    /// 写回给定数据
    pub fn keep(data: serde_json::Value) -> Self {
        Self {
            should_delete: false,
            resolved_data: Some(data),
        }
    }

    /// 放弃本地变更，保留远端现状
    pub fn keep_remote() -> Self {
        Self::default()
    }
}

/// 冲突解决策略接口
#[async_trait::async_trait]
pub trait ConflictResolver: Send + Sync + fmt::Debug {
    async fn resolve_conflict(
        &self,
        conflict: &ConflictData,
        entity_type: EntityType,
    ) -> Result<ConflictResolution>;
}

/// 内置策略选择（配置驱动；自定义实现走 ConflictResolver 注入）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    PreferLocal,
    PreferRemote,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        ConflictStrategy::LastWriteWins
    }
}

impl ConflictStrategy {
    pub fn into_resolver(self) -> Arc<dyn ConflictResolver> {
        match self {
            Self::LastWriteWins => Arc::new(LastWriteWins),
            Self::PreferLocal => Arc::new(PreferLocal),
            Self::PreferRemote => Arc::new(PreferRemote),
        }
    }
}

/// 最后写入胜出策略：比较两侧时间戳，新的一方胜出，平手偏向远端
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

#[async_trait::async_trait]
impl ConflictResolver for LastWriteWins {
    async fn resolve_conflict(
        &self,
        conflict: &ConflictData,
        _entity_type: EntityType,
    ) -> Result<ConflictResolution> {
        match conflict.kind {
            ConflictKind::BothModified => {
                let remote_ts = conflict.remote_timestamp.unwrap_or(0);
                if conflict.local_timestamp > remote_ts {
                    Ok(ConflictResolution::keep(conflict.local_data.clone()))
                } else {
                    // 平手或远端更新：远端胜
                    Ok(ConflictResolution::keep_remote())
                }
            }
            // 远端已删除，删除时间无从比较：保留本地修改意图，重建记录
            ConflictKind::RemoteMissing => {
                Ok(ConflictResolution::keep(conflict.local_data.clone()))
            }
            ConflictKind::StaleDelete => {
                let remote_ts = conflict.remote_timestamp.unwrap_or(0);
                if conflict.local_timestamp > remote_ts {
                    Ok(ConflictResolution::delete())
                } else {
                    Ok(ConflictResolution::keep_remote())
                }
            }
        }
    }
}

/// 本地优先策略：本地变更无条件写回
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

#[async_trait::async_trait]
impl ConflictResolver for PreferLocal {
    async fn resolve_conflict(
        &self,
        conflict: &ConflictData,
        _entity_type: EntityType,
    ) -> Result<ConflictResolution> {
        match conflict.kind {
            ConflictKind::BothModified | ConflictKind::RemoteMissing => {
                Ok(ConflictResolution::keep(conflict.local_data.clone()))
            }
            ConflictKind::StaleDelete => Ok(ConflictResolution::delete()),
        }
    }
}

/// 远端优先策略：放弃所有本地变更
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferRemote;

#[async_trait::async_trait]
impl ConflictResolver for PreferRemote {
    async fn resolve_conflict(
        &self,
        _conflict: &ConflictData,
        _entity_type: EntityType,
    ) -> Result<ConflictResolution> {
        Ok(ConflictResolution::keep_remote())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict(kind: ConflictKind, local_ts: u64, remote_ts: Option<u64>) -> ConflictData {
        ConflictData {
            kind,
            record_id: "col_1".to_string(),
            local_data: json!({"id": "col_1", "address": "local"}),
            local_timestamp: local_ts,
            remote_data: remote_ts.map(|_| json!({"id": "col_1", "address": "remote"})),
            remote_timestamp: remote_ts,
        }
    }

    #[tokio::test]
    async fn test_last_write_wins_both_modified() {
        let resolver = LastWriteWins;

        // 本地更新 → 本地数据写回
        let c = conflict(ConflictKind::BothModified, 2000, Some(1000));
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert!(!r.should_delete);
        assert_eq!(r.resolved_data.unwrap()["address"], "local");

        // 远端更新 → 放弃本地
        let c = conflict(ConflictKind::BothModified, 1000, Some(2000));
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert_eq!(r, ConflictResolution::keep_remote());

        // 平手 → 远端胜
        let c = conflict(ConflictKind::BothModified, 1500, Some(1500));
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert_eq!(r, ConflictResolution::keep_remote());
    }

    #[tokio::test]
    async fn test_last_write_wins_stale_delete() {
        let resolver = LastWriteWins;

        // 删除意图比远端修改新 → 执行删除
        let c = conflict(ConflictKind::StaleDelete, 3000, Some(2000));
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert!(r.should_delete);

        // 远端修改更新 → 放弃删除
        let c = conflict(ConflictKind::StaleDelete, 1000, Some(2000));
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert_eq!(r, ConflictResolution::keep_remote());
    }

    #[tokio::test]
    async fn test_last_write_wins_remote_missing_recreates() {
        let resolver = LastWriteWins;
        let c = conflict(ConflictKind::RemoteMissing, 2000, None);
        let r = resolver
            .resolve_conflict(&c, EntityType::Collections)
            .await
            .unwrap();
        assert!(!r.should_delete);
        assert!(r.resolved_data.is_some());
    }

    #[tokio::test]
    async fn test_prefer_strategies() {
        let c = conflict(ConflictKind::BothModified, 1000, Some(2000));

        let r = PreferLocal
            .resolve_conflict(&c, EntityType::Materials)
            .await
            .unwrap();
        assert_eq!(r.resolved_data.unwrap()["address"], "local");

        let r = PreferRemote
            .resolve_conflict(&c, EntityType::Materials)
            .await
            .unwrap();
        assert_eq!(r, ConflictResolution::keep_remote());
    }

    #[test]
    fn test_strategy_into_resolver() {
        let resolver = ConflictStrategy::default().into_resolver();
        assert!(format!("{:?}", resolver).contains("LastWriteWins"));
    }
}
