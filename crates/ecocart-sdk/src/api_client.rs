//! API 客户端模块 - 面向 REST 后端的统一网络出口
//!
//! 本模块使用 reqwest 作为底层 HTTP 客户端，在其上叠加三层语义：
//! - GET 响应缓存：按请求签名持久化到 KV，TTL 到期自动失效
//! - GET 去重：同签名请求在去重窗口内直接拒绝，超窗则取消旧请求顶替
//! - 取消令牌：所有进行中请求可被统一取消（登出/关停场景）
//!
//! 写请求（POST/PUT/PATCH/DELETE）不缓存不去重，只纳入取消管理。

use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EcoCartSDKError, Result};
use crate::storage::kv::keys;
use crate::storage::KvStore;
use crate::sync::{RemoteRecord, SyncBackend};

/// API 客户端配置
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// REST 后端基础地址（如 https://api.ecocart.app/v1）
    pub base_url: String,
    /// Bearer 鉴权 token
    pub auth_token: Option<String>,
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
    /// GET 响应缓存默认存活时间（毫秒）
    pub default_cache_ttl_ms: u64,
    /// 同签名 GET 的去重窗口（毫秒）
    pub dedup_window_ms: u64,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            auth_token: None,
            connect_timeout_secs: Some(30),
            request_timeout_secs: Some(30),
            default_cache_ttl_ms: 5 * 60 * 1000,
            dedup_window_ms: 5 * 1000,
        }
    }
}

/// 单次 GET 请求的缓存选项
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// 是否允许读写响应缓存
    pub use_cache: bool,
    /// 跳过缓存读取强制走网络（成功结果仍会写回缓存）
    pub force_refresh: bool,
    /// 覆盖默认缓存存活时间（毫秒）
    pub cache_ttl_ms: Option<u64>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force_refresh: false,
            cache_ttl_ms: None,
        }
    }
}

impl RequestOptions {
    pub fn no_cache() -> Self {
        Self {
            use_cache: false,
            ..Default::default()
        }
    }

    pub fn force_refresh() -> Self {
        Self {
            force_refresh: true,
            ..Default::default()
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl_ms = Some(ttl_ms);
        self
    }
}

/// API 响应
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
    /// 是否命中本地缓存（未走网络）
    pub from_cache: bool,
}

/// 持久化的缓存响应（TTL 由 KV 层管理）
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedResponse {
    status: u16,
    body: serde_json::Value,
    cached_at: u64,
}

/// 进行中请求标记
#[derive(Debug)]
struct InFlightRequest {
    /// 发起时间（毫秒时间戳）
    started_at: u64,
    cancel: CancellationToken,
}

/// 请求签名：方法 + 完整 URL + 参数 JSON 的 SHA-256
///
/// serde_json 默认按键排序输出对象，同样的参数集合总能得到同一签名。
fn request_signature(method: &str, url: &str, params: Option<&serde_json::Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    if let Some(params) = params {
        hasher.update(params.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// 检查响应状态并读出 JSON 响应体（空响应体归一化为 Null）
async fn read_json_body(response: reqwest::Response) -> Result<(u16, serde_json::Value)> {
    let status = response.status();
    let status_code = status.as_u16();
    if !status.is_success() {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "无法读取错误信息".to_string());
        return Err(EcoCartSDKError::http(status_code, error_text));
    }

    let text = response
        .text()
        .await
        .map_err(|e| EcoCartSDKError::Transport(format!("读取响应体失败: {}", e)))?;
    let body = if text.trim().is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_str(&text)
            .map_err(|e| EcoCartSDKError::Serialization(format!("解析响应体失败: {}", e)))?
    };
    Ok((status_code, body))
}

/// API 客户端
#[derive(Debug)]
pub struct ApiClient {
    config: ApiClientConfig,
    client: Client,
    kv: Arc<KvStore>,
    /// 进行中请求表：GET 用请求签名做键，写请求用随机键
    in_flight: Mutex<HashMap<String, InFlightRequest>>,
}

impl ApiClient {
    /// 创建新的 API 客户端
    pub fn new(config: ApiClientConfig, kv: Arc<KvStore>) -> Result<Self> {
        let mut builder = Client::builder();

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| EcoCartSDKError::Other(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ API 客户端已创建 (base_url: {})", config.base_url);

        Ok(Self {
            config,
            client,
            kv,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn build_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }

    /// 登记去重标记并返回本次请求的取消令牌
    ///
    /// 同签名请求仍在窗口内：拒绝。已超窗：按挂死处理，取消旧请求后顶替。
    fn register_in_flight(&self, signature: &str, path: &str) -> Result<CancellationToken> {
        let now = Self::now_ms();
        let mut in_flight = self.in_flight.lock();

        if let Some(existing) = in_flight.get(signature) {
            let age_ms = now.saturating_sub(existing.started_at);
            if age_ms < self.config.dedup_window_ms {
                debug!("🔁 去重命中，拒绝重复请求: {} ({}ms)", path, age_ms);
                return Err(EcoCartSDKError::RequestInFlight(path.to_string()));
            }
            warn!("取消超窗的进行中请求: {} ({}ms)", path, age_ms);
            existing.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        in_flight.insert(
            signature.to_string(),
            InFlightRequest {
                started_at: now,
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// 用随机键登记进行中请求（写请求与同步拉取，不参与去重）
    fn track_request(&self, prefix: &str) -> (String, CancellationToken) {
        let marker = format!("{}:{}", prefix, uuid::Uuid::new_v4());
        let cancel = CancellationToken::new();
        self.in_flight.lock().insert(
            marker.clone(),
            InFlightRequest {
                started_at: Self::now_ms(),
                cancel: cancel.clone(),
            },
        );
        (marker, cancel)
    }

    /// GET 请求：先查去重表，再查缓存，最后走网络
    ///
    /// `params` 预期为扁平 JSON 对象，会作为查询参数拼到 URL 上。
    pub async fn get(
        &self,
        path: &str,
        params: Option<&serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<ApiResponse> {
        let url = self.build_url(path);
        let signature = request_signature("GET", &url, params);

        // 1. 去重检查
        let cancel = self.register_in_flight(&signature, path)?;

        let result = self
            .get_inner(&url, params, options, &signature, &cancel)
            .await;

        // 2. 进行中标记无论成败都要移除
        self.in_flight.lock().remove(&signature);

        result
    }

    async fn get_inner(
        &self,
        url: &str,
        params: Option<&serde_json::Value>,
        options: &RequestOptions,
        signature: &str,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let cache_key = format!("{}{}", keys::API_CACHE, signature);

        // 1. 缓存检查
        if options.use_cache && !options.force_refresh {
            if let Some(cached) = self.kv.get_with_ttl::<_, CachedResponse>(&cache_key).await? {
                debug!("📦 缓存命中: {}", url);
                return Ok(ApiResponse {
                    status: cached.status,
                    body: cached.body,
                    from_cache: true,
                });
            }
        }

        // 2. 构造请求
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(params) = params {
            request = request.query(params);
        }

        // 3. 发送请求（留意取消令牌）
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EcoCartSDKError::RequestCancelled(url.to_string()));
            }
            resp = request.send() => resp?,
        };

        let (status, body) = read_json_body(response).await?;

        // 4. 写入缓存（失败只告警，不影响本次响应）
        if options.use_cache {
            let ttl_ms = options
                .cache_ttl_ms
                .unwrap_or(self.config.default_cache_ttl_ms);
            let cached = CachedResponse {
                status,
                body: body.clone(),
                cached_at: Self::now_ms(),
            };
            if let Err(e) = self.kv.set_with_ttl(&cache_key, &cached, ttl_ms).await {
                warn!("写入响应缓存失败: {}", e);
            }
        }

        Ok(ApiResponse {
            status,
            body,
            from_cache: false,
        })
    }

    /// POST 请求
    pub async fn post(&self, path: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        self.send_mutation(reqwest::Method::POST, path, Some(body))
            .await
    }

    /// PUT 请求
    pub async fn put(&self, path: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        self.send_mutation(reqwest::Method::PUT, path, Some(body))
            .await
    }

    /// PATCH 请求
    pub async fn patch(&self, path: &str, body: &serde_json::Value) -> Result<ApiResponse> {
        self.send_mutation(reqwest::Method::PATCH, path, Some(body))
            .await
    }

    /// DELETE 请求
    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send_mutation(reqwest::Method::DELETE, path, None).await
    }

    async fn send_mutation(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<ApiResponse> {
        let url = self.build_url(path);
        let (marker, cancel) = self.track_request(method.as_str());

        let result = self.send_mutation_inner(method, &url, body, &cancel).await;

        self.in_flight.lock().remove(&marker);

        result
    }

    async fn send_mutation_inner(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<&serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<ApiResponse> {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EcoCartSDKError::RequestCancelled(url.to_string()));
            }
            resp = request.send() => resp?,
        };

        let (status, body) = read_json_body(response).await?;
        Ok(ApiResponse {
            status,
            body,
            from_cache: false,
        })
    }

    /// 清空响应缓存，返回移除的条目数
    pub async fn clear_cache(&self) -> Result<u64> {
        let removed = self.kv.remove_prefix(keys::API_CACHE.as_bytes()).await?;
        info!("🧹 已清空响应缓存: {} 条", removed);
        Ok(removed)
    }

    /// 清理已过期的缓存条目，返回移除的条目数
    pub async fn purge_expired_cache(&self) -> Result<u64> {
        self.kv.cleanup_expired().await
    }

    /// 取消所有进行中请求，返回取消的数量
    pub fn cancel_all_requests(&self, reason: &str) -> usize {
        let mut in_flight = self.in_flight.lock();
        let count = in_flight.len();
        for (_, request) in in_flight.drain() {
            request.cancel.cancel();
        }
        if count > 0 {
            warn!("❌ 已取消 {} 个进行中请求: {}", count, reason);
        }
        count
    }

    /// 当前进行中请求数
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// 同步消费循环依赖的远端接口实现
///
/// 冲突检测要看服务端即时状态，fetch_record 绕过缓存与去重，
/// 但仍纳入取消令牌管理。
#[async_trait::async_trait]
impl SyncBackend for ApiClient {
    async fn fetch_record(
        &self,
        endpoint: &str,
        record_id: &str,
    ) -> Result<Option<RemoteRecord>> {
        let path = format!("{}/{}", endpoint.trim_end_matches('/'), record_id);
        let url = self.build_url(&path);
        let (marker, cancel) = self.track_request("sync-get");

        let result = async {
            let mut request = self.client.get(&url);
            if let Some(token) = &self.config.auth_token {
                request = request.bearer_auth(token);
            }
            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EcoCartSDKError::RequestCancelled(url.clone()));
                }
                resp = request.send() => resp?,
            };
            read_json_body(response).await
        }
        .await;

        self.in_flight.lock().remove(&marker);

        match result {
            Ok((_, body)) => Ok(Some(RemoteRecord::from_value(body))),
            Err(EcoCartSDKError::Http { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_record(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> Result<RemoteRecord> {
        let response = self.post(endpoint, body).await?;
        Ok(RemoteRecord::from_value(response.body))
    }

    async fn update_record(
        &self,
        endpoint: &str,
        record_id: &str,
        body: &serde_json::Value,
    ) -> Result<RemoteRecord> {
        let path = format!("{}/{}", endpoint.trim_end_matches('/'), record_id);
        let response = self.put(&path, body).await?;
        Ok(RemoteRecord::from_value(response.body))
    }

    async fn delete_record(&self, endpoint: &str, record_id: &str) -> Result<()> {
        let path = format!("{}/{}", endpoint.trim_end_matches('/'), record_id);
        match self.delete(&path).await {
            Ok(_) => Ok(()),
            // 已不存在视为删除成功
            Err(EcoCartSDKError::Http { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
