use serde::{Deserialize, Serialize};
use crate::error::{EcoCartSDKError, Result};

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncFailureReason {
    /// 网络超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 等待恢复后重试
    NetworkUnavailable,
    /// 服务端错误 - 根据错误码决定
    ServerError(u16),
    /// 认证失败 - 需要重新登录
    AuthFailure,
    /// 限流 - 延迟重试
    RateLimited,
    /// 请求体过大 - 不重试
    PayloadTooLarge,
    /// 权限不足 - 不重试
    Forbidden,
    /// 版本冲突未能解决 - 重试不会改变结果，不重试
    VersionConflict,
    /// 任务载荷无效（如缺少 record_id）- 重试不会改变结果，不重试
    InvalidPayload,
    /// 未知错误
    Unknown(String),
}

impl SyncFailureReason {
    /// 判断是否可以重试
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncFailureReason::NetworkTimeout => true,
            SyncFailureReason::NetworkUnavailable => true,
            SyncFailureReason::ServerError(code) => {
                // 5xx 服务端错误可重试，4xx 客户端错误不重试
                *code >= 500 && *code < 600
            }
            SyncFailureReason::AuthFailure => true, // 重新认证后可重试
            SyncFailureReason::RateLimited => true,
            SyncFailureReason::PayloadTooLarge => false,
            SyncFailureReason::Forbidden => false,
            SyncFailureReason::VersionConflict => false,
            SyncFailureReason::InvalidPayload => false,
            SyncFailureReason::Unknown(_) => true, // 保守策略：未知错误可重试
        }
    }

    /// 获取重试延迟倍数
    pub fn get_delay_multiplier(&self) -> f64 {
        match self {
            SyncFailureReason::NetworkTimeout => 1.0,
            SyncFailureReason::NetworkUnavailable => 2.0,
            SyncFailureReason::ServerError(_) => 1.5,
            SyncFailureReason::AuthFailure => 0.5, // 认证失败快速重试
            SyncFailureReason::RateLimited => 3.0, // 限流需要更长延迟
            _ => 1.0,
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大失败尝试次数（第 max_retries 次失败不再排期，任务转入 Failed 终态）
    pub max_retries: u32,
    /// 基础延迟时间（秒）
    pub base_delay_seconds: u64,
    /// 最大延迟时间（秒）
    pub max_delay_seconds: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_seconds: 1,
            max_delay_seconds: 300, // 5分钟
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 用于测试的零延迟策略（立即可重试）
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_seconds: 0,
            max_delay_seconds: 0,
            backoff_factor: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// 计算下次重试时间（毫秒时间戳），retry_count 含本次失败
    pub fn calculate_next_retry_at(
        &self,
        retry_count: u32,
        failure_reason: &SyncFailureReason,
    ) -> Option<u64> {
        if retry_count >= self.max_retries || !failure_reason.is_retryable() {
            return None;
        }

        // 基础延迟 = base_delay * (backoff_factor ^ retry_count)
        let base_delay = self.base_delay_seconds as f64
            * self.backoff_factor.powf(retry_count as f64);

        // 应用失败原因的延迟倍数
        let adjusted_delay = base_delay * failure_reason.get_delay_multiplier();

        // 限制最大延迟
        let capped_delay = adjusted_delay.min(self.max_delay_seconds as f64);

        // 添加随机抖动
        let jitter = capped_delay * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped_delay + jitter).max(0.0);

        let now = chrono::Utc::now().timestamp_millis() as u64;
        Some(now + (final_delay * 1000.0) as u64)
    }

    /// 检查是否应该重试（retry_count 含本次失败，达到 max_retries 即终态）
    pub fn should_retry(&self, retry_count: u32, failure_reason: &SyncFailureReason) -> bool {
        retry_count < self.max_retries && failure_reason.is_retryable()
    }
}

/// 重试状态管理器
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 处理同步失败，返回下次重试时间（None 表示不再重试，任务转入终态）
    ///
    /// current_retry_count 为含本次失败在内的累计次数。
    pub fn handle_sync_failure(
        &self,
        current_retry_count: u32,
        failure_reason: &SyncFailureReason,
    ) -> Result<Option<u64>> {
        if !self.policy.should_retry(current_retry_count, failure_reason) {
            return Ok(None);
        }

        Ok(self
            .policy
            .calculate_next_retry_at(current_retry_count, failure_reason))
    }

    /// 检查任务是否已到重试时间（毫秒时间戳）
    pub fn can_retry_now(&self, next_retry_at: u64) -> bool {
        let now = chrono::Utc::now().timestamp_millis() as u64;
        now >= next_retry_at
    }
}

/// 从错误转换为失败原因
impl From<&EcoCartSDKError> for SyncFailureReason {
    fn from(error: &EcoCartSDKError) -> Self {
        match error {
            EcoCartSDKError::Timeout(_) => SyncFailureReason::NetworkTimeout,
            EcoCartSDKError::Transport(msg) => {
                if msg.contains("timeout") {
                    SyncFailureReason::NetworkTimeout
                } else {
                    SyncFailureReason::NetworkUnavailable
                }
            }
            EcoCartSDKError::Http { status, .. } => match status {
                401 => SyncFailureReason::AuthFailure,
                403 => SyncFailureReason::Forbidden,
                413 => SyncFailureReason::PayloadTooLarge,
                429 => SyncFailureReason::RateLimited,
                code => SyncFailureReason::ServerError(*code),
            },
            EcoCartSDKError::Conflict(_) => SyncFailureReason::VersionConflict,
            EcoCartSDKError::InvalidInput(_) | EcoCartSDKError::InvalidOperation(_) => {
                SyncFailureReason::InvalidPayload
            }
            other => SyncFailureReason::Unknown(other.to_string()),
        }
    }
}
