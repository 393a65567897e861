//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 人类可读字符串键 + JSON 值的持久化存储
//! - 原子操作和批量操作
//! - 带 TTL 的缓存条目（读时惰性淘汰 + 批量清理）
//! - 前缀扫描与前缀删除（队列 / 响应缓存的底座）

use std::path::{Path, PathBuf};
use std::sync::Arc;
use sled::{Db, Tree};
use serde::{Serialize, Deserialize};
use crate::error::{EcoCartSDKError, Result};
use crate::storage::KvStats;

/// 主 Tree 名称（队列、计数器、响应缓存共用一个命名空间）
const STATE_TREE: &str = "ecocart_state";

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    #[allow(dead_code)]
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 状态 Tree
    tree: Tree,
}

impl KvStore {
    /// 创建新的 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        // 创建 KV 存储目录
        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| EcoCartSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（应用重启后旧实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            EcoCartSDKError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = db.open_tree(STATE_TREE)
            .map_err(|e| EcoCartSDKError::KvStore(format!("打开状态 Tree 失败: {}", e)))?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree,
        })
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| EcoCartSDKError::Serialization(format!("序列化值失败: {}", e)))?;

        self.tree.insert(key, value_bytes)
            .map_err(|e| EcoCartSDKError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self.tree.get(key)
            .map_err(|e| EcoCartSDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| EcoCartSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let result = self.tree.remove(key)
            .map_err(|e| EcoCartSDKError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.map(|v| v.to_vec()))
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let result = self.tree.contains_key(key)
            .map_err(|e| EcoCartSDKError::KvStore(format!("检查键存在失败: {}", e)))?;

        Ok(result)
    }

    /// 批量设置键值对
    pub async fn set_batch<K, V>(&self, pairs: Vec<(K, V)>) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let mut batch = sled::Batch::default();

        for (key, value) in pairs {
            let value_bytes = serde_json::to_vec(&value)
                .map_err(|e| EcoCartSDKError::Serialization(format!("序列化值失败: {}", e)))?;
            batch.insert(key.as_ref(), value_bytes);
        }

        self.tree.apply_batch(batch)
            .map_err(|e| EcoCartSDKError::KvStore(format!("批量设置失败: {}", e)))?;

        Ok(())
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();

        for result in self.tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| EcoCartSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| EcoCartSDKError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 删除指定前缀的所有键，返回删除数量
    pub async fn remove_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let mut keys_to_remove = Vec::new();

        for result in self.tree.scan_prefix(prefix) {
            let (key, _) = result
                .map_err(|e| EcoCartSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;
            keys_to_remove.push(key.to_vec());
        }

        let mut removed_count = 0u64;
        for key in keys_to_remove {
            self.tree.remove(&key)
                .map_err(|e| EcoCartSDKError::KvStore(format!("删除键失败: {}", e)))?;
            removed_count += 1;
        }

        Ok(removed_count)
    }

    /// 原子性增加计数器
    pub async fn increment_counter(&self, key: &str, delta: i64) -> Result<i64> {
        loop {
            let (current_value, current_bytes) = match self.tree.get(key)
                .map_err(|e| EcoCartSDKError::KvStore(format!("获取计数器失败: {}", e)))? {
                Some(bytes) => {
                    let value_str = std::str::from_utf8(&bytes)
                        .map_err(|e| EcoCartSDKError::KvStore(format!("计数器值格式错误: {}", e)))?;
                    let value = value_str.parse::<i64>()
                        .map_err(|e| EcoCartSDKError::KvStore(format!("计数器值解析失败: {}", e)))?;
                    (value, Some(bytes))
                }
                None => (0, None),
            };

            let new_value = current_value + delta;
            let new_value_bytes = new_value.to_string().into_bytes();

            // 使用 compare_and_swap 实现原子性
            let result = self.tree.compare_and_swap(
                key,
                current_bytes,
                Some(new_value_bytes),
            ).map_err(|e| EcoCartSDKError::KvStore(format!("原子增加失败: {}", e)))?;

            match result {
                Ok(_) => return Ok(new_value),
                Err(_) => {
                    // 如果 CAS 失败，重试
                    tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
                    continue;
                }
            }
        }
    }

    /// 读取计数器当前值（不存在视为 0）
    pub async fn get_counter(&self, key: &str) -> Result<i64> {
        match self.tree.get(key)
            .map_err(|e| EcoCartSDKError::KvStore(format!("获取计数器失败: {}", e)))? {
            Some(bytes) => {
                let value_str = std::str::from_utf8(&bytes)
                    .map_err(|e| EcoCartSDKError::KvStore(format!("计数器值格式错误: {}", e)))?;
                value_str.parse::<i64>()
                    .map_err(|e| EcoCartSDKError::KvStore(format!("计数器值解析失败: {}", e)))
            }
            None => Ok(0),
        }
    }

    /// 设置带过期时间的键值对（毫秒粒度，缓存条目用）
    pub async fn set_with_ttl<K, V>(&self, key: K, value: &V, ttl_ms: u64) -> Result<()>
    where
        K: AsRef<[u8]> + Clone,
        V: Serialize,
    {
        let expired_value = ExpiredValue {
            value: serde_json::to_value(value)
                .map_err(|e| EcoCartSDKError::Serialization(format!("序列化值失败: {}", e)))?,
            expires_at: chrono::Utc::now().timestamp_millis() + ttl_ms as i64,
        };

        let value_bytes = serde_json::to_vec(&expired_value)
            .map_err(|e| EcoCartSDKError::Serialization(format!("序列化过期值失败: {}", e)))?;

        self.tree.insert(key, value_bytes)
            .map_err(|e| EcoCartSDKError::KvStore(format!("设置带 TTL 的键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取带过期时间的键值对（过期条目读时删除并返回 None）
    pub async fn get_with_ttl<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]> + Clone,
        V: for<'de> Deserialize<'de>,
    {
        let result = self.tree.get(key.clone())
            .map_err(|e| EcoCartSDKError::KvStore(format!("获取带 TTL 的键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let expired_value: ExpiredValue = serde_json::from_slice(&value_bytes)
                    .map_err(|e| EcoCartSDKError::Serialization(format!("反序列化过期值失败: {}", e)))?;

                let now = chrono::Utc::now().timestamp_millis();
                if now > expired_value.expires_at {
                    // 键已过期，删除并返回 None
                    self.tree.remove(key)
                        .map_err(|e| EcoCartSDKError::KvStore(format!("删除过期键失败: {}", e)))?;
                    return Ok(None);
                }

                let value = serde_json::from_value(expired_value.value)
                    .map_err(|e| EcoCartSDKError::Serialization(format!("反序列化值失败: {}", e)))?;

                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 清理过期的键值对
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let mut removed_count = 0u64;
        let now = chrono::Utc::now().timestamp_millis();

        let mut keys_to_remove = Vec::new();

        for result in self.tree.iter() {
            let (key, value_bytes) = result
                .map_err(|e| EcoCartSDKError::KvStore(format!("遍历键值对失败: {}", e)))?;

            // 只有 TTL 包装形态的值会解析成功，队列任务和计数器不受影响
            if let Ok(expired_value) = serde_json::from_slice::<ExpiredValue>(&value_bytes) {
                if now > expired_value.expires_at {
                    keys_to_remove.push(key.to_vec());
                }
            }
        }

        for key in keys_to_remove {
            self.tree.remove(&key)
                .map_err(|e| EcoCartSDKError::KvStore(format!("删除过期键失败: {}", e)))?;
            removed_count += 1;
        }

        Ok(removed_count)
    }

    /// 落盘（关闭前调用）
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await
            .map_err(|e| EcoCartSDKError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub async fn get_stats(&self) -> Result<KvStats> {
        let key_count = self.tree.len() as u64;
        // 注意：sled Tree 没有 size_on_disk 方法，我们用一个估算值
        let tree_size = key_count * 256; // 假设每个键值对平均 256 字节

        Ok(KvStats {
            tree_size,
            key_count,
            total_keys: key_count,
            storage_size: tree_size,
        })
    }
}

/// 带过期时间的值结构
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExpiredValue {
    value: serde_json::Value,
    expires_at: i64,
}

/// 常用的键与键前缀常量
pub mod keys {
    /// 同步队列任务前缀（`sync_queue:<task_id>`）
    pub const SYNC_QUEUE: &str = "sync_queue:";
    /// 同步成功计数器
    pub const SYNC_COMPLETED_COUNT: &str = "sync_completed_count";
    /// API 响应缓存前缀（`api_cache:<signature>`）
    pub const API_CACHE: &str = "api_cache:";
    /// 最近一次成功同步完成的时间戳（毫秒）
    pub const LAST_SYNC_AT: &str = "last_sync_at";
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 设置和获取
        let test_data = json!({
            "name": "glass bottles",
            "quantity_kg": 4.5
        });

        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        // 检查存在性
        assert!(store.exists("test_key").await.unwrap());
        assert!(!store.exists("non_existent_key").await.unwrap());

        // 删除
        store.delete("test_key").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_batch_and_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 批量设置
        let pairs = vec![
            ("api_cache:aaa", json!({"value": 1})),
            ("api_cache:bbb", json!({"value": 2})),
            ("sync_queue:ccc", json!({"value": 3})),
        ];

        store.set_batch(pairs).await.unwrap();

        // 前缀扫描只命中缓存键
        let results: Vec<(Vec<u8>, serde_json::Value)> =
            store.scan_prefix(keys::API_CACHE.as_bytes()).await.unwrap();
        assert_eq!(results.len(), 2);

        // 前缀删除不影响其他命名空间
        let removed = store.remove_prefix(keys::API_CACHE.as_bytes()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(!store.exists("api_cache:aaa").await.unwrap());
        assert!(store.exists("sync_queue:ccc").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_store_counter() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        let counter_key = keys::SYNC_COMPLETED_COUNT;

        assert_eq!(store.get_counter(counter_key).await.unwrap(), 0);

        let result1 = store.increment_counter(counter_key, 5).await.unwrap();
        assert_eq!(result1, 5);

        let result2 = store.increment_counter(counter_key, 3).await.unwrap();
        assert_eq!(result2, 8);

        let result3 = store.increment_counter(counter_key, -2).await.unwrap();
        assert_eq!(result3, 6);

        assert_eq!(store.get_counter(counter_key).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_kv_store_ttl() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        // 设置带 TTL 的值
        let test_data = json!({"message": "cached response"});
        store.set_with_ttl("ttl_key", &test_data, 200).await.unwrap();

        // 立即获取应该成功
        let retrieved: Option<serde_json::Value> = store.get_with_ttl("ttl_key").await.unwrap();
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap(), test_data);

        // 等待过期
        tokio::time::sleep(tokio::time::Duration::from_millis(400)).await;

        // 再次获取应该返回 None，且条目被删除
        let expired: Option<serde_json::Value> = store.get_with_ttl("ttl_key").await.unwrap();
        assert!(expired.is_none());
        assert!(!store.exists("ttl_key").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_store_cleanup_expired() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path()).await.unwrap();

        store.set_with_ttl("api_cache:short", &json!({"v": 1}), 100).await.unwrap();
        store.set_with_ttl("api_cache:long", &json!({"v": 2}), 60_000).await.unwrap();
        store.set("sync_queue:task", &json!({"task_id": "t1"})).await.unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(300)).await;

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!store.exists("api_cache:short").await.unwrap());
        assert!(store.exists("api_cache:long").await.unwrap());
        assert!(store.exists("sync_queue:task").await.unwrap());
    }
}
