//! 数据实体定义 - 对应服务端资源结构
//!
//! 这里定义了三类可同步实体对应的 Rust 结构体，用于：
//! - 类型安全的变更载荷（替代无类型 JSON）
//! - 部分更新：所有字段可选，序列化时跳过未设置字段
//! - 序列化/反序列化支持

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 实体类型（受控枚举，新增需 SDK 与 Server 同步升级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Collections,
    Materials,
    Users,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collections => "collections",
            Self::Materials => "materials",
            Self::Users => "users",
        }
    }

    /// 实体对应的 REST 端点
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Collections => "/collections",
            Self::Materials => "/materials",
            Self::Users => "/users",
        }
    }

    pub fn all() -> [EntityType; 3] {
        [Self::Collections, Self::Materials, Self::Users]
    }
}

impl FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collections" => Ok(Self::Collections),
            "materials" => Ok(Self::Materials),
            "users" => Ok(Self::Users),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 回收预约状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

/// 回收预约实体 - 对应 /collections 资源
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// 预约上门时间（毫秒时间戳，与服务端一致）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// 本次回收的材料类别列表
    #[serde(skip_serializing_if = "Option::is_none")]
    pub material_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CollectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// 服务端乐观锁版本号
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// 可回收材料实体 - 对应 /materials 资源
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// 每公斤减碳量（kg CO2e）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub co2_saved_per_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recyclable: Option<bool>,
    /// 每公斤积分
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_per_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// 用户实体 - 对应 /users 资源
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// 环保积分余额
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eco_points: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// 类型化变更载荷 - 按实体类型打标签的联合体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "record", rename_all = "snake_case")]
pub enum EntityPayload {
    Collection(CollectionRecord),
    Material(MaterialRecord),
    User(UserRecord),
}

impl EntityPayload {
    /// 仅携带 id 的载荷（删除操作用）
    pub fn reference(entity_type: EntityType, record_id: &str) -> Self {
        let id = Some(record_id.to_string());
        match entity_type {
            EntityType::Collections => Self::Collection(CollectionRecord {
                id,
                ..Default::default()
            }),
            EntityType::Materials => Self::Material(MaterialRecord {
                id,
                ..Default::default()
            }),
            EntityType::Users => Self::User(UserRecord {
                id,
                ..Default::default()
            }),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Collection(_) => EntityType::Collections,
            Self::Material(_) => EntityType::Materials,
            Self::User(_) => EntityType::Users,
        }
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            Self::Collection(r) => r.id.as_deref(),
            Self::Material(r) => r.id.as_deref(),
            Self::User(r) => r.id.as_deref(),
        }
    }

    pub fn version(&self) -> Option<u64> {
        match self {
            Self::Collection(r) => r.version,
            Self::Material(r) => r.version,
            Self::User(r) => r.version,
        }
    }

    /// 序列化为请求体 JSON（只含记录字段，不含实体标签）
    pub fn to_value(&self) -> crate::error::Result<serde_json::Value> {
        let value = match self {
            Self::Collection(r) => serde_json::to_value(r)?,
            Self::Material(r) => serde_json::to_value(r)?,
            Self::User(r) => serde_json::to_value(r)?,
        };
        Ok(value)
    }

    /// 从记录 JSON 还原载荷（冲突解决后的数据回填用）
    pub fn from_value(
        entity_type: EntityType,
        value: serde_json::Value,
    ) -> crate::error::Result<Self> {
        let payload = match entity_type {
            EntityType::Collections => Self::Collection(serde_json::from_value(value)?),
            EntityType::Materials => Self::Material(serde_json::from_value(value)?),
            EntityType::Users => Self::User(serde_json::from_value(value)?),
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn entity_type_as_str_and_from_str() {
        assert_eq!(EntityType::Collections.as_str(), "collections");
        assert_eq!(EntityType::Materials.as_str(), "materials");
        assert_eq!(EntityType::Users.endpoint(), "/users");
        assert_eq!(
            EntityType::from_str("collections").unwrap(),
            EntityType::Collections
        );
        assert_eq!(EntityType::from_str("materials").unwrap(), EntityType::Materials);
        assert!(EntityType::from_str("unknown").is_err());
    }

    #[test]
    fn payload_partial_update_skips_unset_fields() {
        let payload = EntityPayload::Collection(CollectionRecord {
            id: Some("col_1".to_string()),
            status: Some(CollectionStatus::Cancelled),
            ..Default::default()
        });

        let body = payload.to_value().unwrap();
        assert_eq!(body["id"], "col_1");
        assert_eq!(body["status"], "cancelled");
        // 未设置的字段不应出现在请求体里
        assert!(body.get("address").is_none());
        assert!(body.get("version").is_none());
    }

    #[test]
    fn payload_tagged_roundtrip() {
        let payload = EntityPayload::Material(MaterialRecord {
            id: Some("mat_glass".to_string()),
            name: Some("Glass".to_string()),
            co2_saved_per_kg: Some(0.31),
            ..Default::default()
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["entity"], "material");
        assert_eq!(json["record"]["name"], "Glass");

        let back: EntityPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.entity_type(), EntityType::Materials);
    }

    #[test]
    fn payload_reference_carries_only_id() {
        let payload = EntityPayload::reference(EntityType::Users, "user_9");
        assert_eq!(payload.record_id(), Some("user_9"));
        assert_eq!(payload.entity_type(), EntityType::Users);

        let body = payload.to_value().unwrap();
        assert_eq!(body.as_object().unwrap().len(), 1);
    }
}
