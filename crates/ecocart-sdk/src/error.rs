//! SDK 统一错误类型
//!
//! 所有公开 API 返回 `Result<T>`（`EcoCartSDKError` 的别名封装）。
//! 同步队列通过 `SyncFailureReason`（见 `storage::queue::retry_policy`）
//! 对错误做可重试性分类，本模块只负责错误的表达与传播。

use thiserror::Error;

/// SDK 统一结果类型
pub type Result<T> = std::result::Result<T, EcoCartSDKError>;

/// SDK 错误
#[derive(Error, Debug)]
pub enum EcoCartSDKError {
    /// KV 存储错误
    #[error("KV store error: {0}")]
    KvStore(String),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO 错误
    #[error("IO error: {0}")]
    IO(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// SDK 未初始化
    #[error("SDK not initialized: {0}")]
    NotInitialized(String),

    /// SDK 正在关闭
    #[error("SDK is shutting down")]
    ShuttingDown,

    /// 网络传输错误（连接失败、DNS、TLS 等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 请求超时
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// HTTP 非 2xx 响应
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// 相同签名的请求已在进行中（去重窗口内）
    #[error("Request already in progress: {0}")]
    RequestInFlight(String),

    /// 请求被取消
    #[error("Request cancelled: {0}")]
    RequestCancelled(String),

    /// 数据版本冲突
    #[error("Version conflict: {0}")]
    Conflict(String),

    /// 无效输入
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 无效操作
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// 资源不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 其他错误
    #[error("Unknown error: {0}")]
    Other(String),
}

impl EcoCartSDKError {
    pub fn kv_store<S: Into<String>>(msg: S) -> Self {
        Self::KvStore(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// HTTP 错误的状态码（其他错误返回 None）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EcoCartSDKError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EcoCartSDKError {
    fn from(err: std::io::Error) -> Self {
        Self::IO(err.to_string())
    }
}

impl From<sled::Error> for EcoCartSDKError {
    fn from(err: sled::Error) -> Self {
        Self::KvStore(err.to_string())
    }
}

impl From<reqwest::Error> for EcoCartSDKError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EcoCartSDKError::http(503, "service unavailable");
        assert_eq!(err.to_string(), "HTTP 503: service unavailable");
        assert_eq!(err.http_status(), Some(503));

        let err = EcoCartSDKError::RequestInFlight("GET /collections".to_string());
        assert!(err.to_string().contains("already in progress"));
        assert_eq!(err.http_status(), None);
    }

    #[test]
    fn test_from_serde_json() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: EcoCartSDKError = parse_err.into();
        assert!(matches!(err, EcoCartSDKError::Serialization(_)));
    }
}
