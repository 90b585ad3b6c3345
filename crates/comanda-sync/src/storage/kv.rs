//! KV 存储模块 - 基于 sled 的本地键值存储
//!
//! 离线队列的主存储：
//! - 崩溃安全，写入后显式刷盘
//! - 每个租户（门店）一个 Tree
//! - 值统一为 JSON 字节

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ComandaSyncError, Result};

/// 打开数据库时遇到文件锁的重试次数（上一个实例可能刚释放锁）
const OPEN_ATTEMPTS: u32 = 4;
const OPEN_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    db: Db,
    /// 已打开的租户 Tree
    tenant_trees: RwLock<HashMap<String, Tree>>,
    /// 当前租户及其 Tree
    active: RwLock<Option<(String, Tree)>>,
}

impl KvStore {
    /// 在 `base_path/offline_queue` 下打开 KV 存储
    pub async fn new(base_path: &Path) -> Result<Self> {
        let kv_path = base_path.join("offline_queue");
        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| ComandaSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        let db = open_with_retry(&kv_path).await?;
        debug!("sled 数据库已打开: {}", kv_path.display());

        Ok(Self {
            db,
            tenant_trees: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        })
    }

    /// 切换到租户命名空间，首次使用时创建 Tree
    pub async fn switch_tenant(&self, tenant_id: &str) -> Result<()> {
        let cached = self.tenant_trees.read().await.get(tenant_id).cloned();
        let tree = match cached {
            Some(tree) => tree,
            None => {
                let tree = self
                    .db
                    .open_tree(format!("tenant_{}", tenant_id))
                    .map_err(|e| ComandaSyncError::KvStore(format!("打开租户 Tree 失败: {}", e)))?;
                self.tenant_trees
                    .write()
                    .await
                    .insert(tenant_id.to_string(), tree.clone());
                info!("租户 KV Tree 初始化完成: {}", tenant_id);
                tree
            }
        };

        *self.active.write().await = Some((tenant_id.to_string(), tree));
        Ok(())
    }

    /// 当前租户 ID
    pub async fn current_tenant(&self) -> Option<String> {
        self.active.read().await.as_ref().map(|(id, _)| id.clone())
    }

    async fn tree(&self) -> Result<Tree> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|(_, tree)| tree.clone())
            .ok_or_else(|| ComandaSyncError::NotInitialized("未选择租户".to_string()))
    }

    /// 写入 JSON 值
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let bytes = encode(value)?;
        self.tree()
            .await?
            .insert(key, bytes)
            .map_err(|e| ComandaSyncError::KvStore(format!("写入失败: {}", e)))?;
        Ok(())
    }

    /// 读取 JSON 值
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let raw = self
            .tree()
            .await?
            .get(key)
            .map_err(|e| ComandaSyncError::KvStore(format!("读取失败: {}", e)))?;

        raw.map(|bytes| {
            serde_json::from_slice(&bytes)
                .map_err(|e| ComandaSyncError::Serialization(format!("反序列化值失败: {}", e)))
        })
        .transpose()
    }

    /// 删除键，返回旧值（键不存在时为 None，不视为错误）
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let old = self
            .tree()
            .await?
            .remove(key)
            .map_err(|e| ComandaSyncError::KvStore(format!("删除失败: {}", e)))?;
        Ok(old.map(|v| v.to_vec()))
    }

    /// 按键字节序返回前缀下的原始键值对，不做反序列化
    pub async fn scan_prefix_raw(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree()
            .await?
            .scan_prefix(prefix)
            .map(|entry| {
                entry
                    .map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| ComandaSyncError::KvStore(format!("扫描前缀失败: {}", e)))
            })
            .collect()
    }

    /// 原子删除前缀下的所有键，返回删除数量
    pub async fn remove_prefix(&self, prefix: &[u8]) -> Result<u64> {
        let tree = self.tree().await?;
        let mut batch = sled::Batch::default();
        let mut removed = 0u64;

        for key in tree.scan_prefix(prefix).keys() {
            let key = key.map_err(|e| ComandaSyncError::KvStore(format!("扫描前缀失败: {}", e)))?;
            batch.remove(key);
            removed += 1;
        }

        tree.apply_batch(batch)
            .map_err(|e| ComandaSyncError::KvStore(format!("批量删除失败: {}", e)))?;
        Ok(removed)
    }

    /// 原子写入一组已编码的值，要么全部生效，要么都不生效
    pub async fn insert_batch<K>(&self, entries: Vec<(K, Vec<u8>)>) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            batch.insert(key.as_ref(), value);
        }
        self.tree()
            .await?
            .apply_batch(batch)
            .map_err(|e| ComandaSyncError::KvStore(format!("批量写入失败: {}", e)))?;
        Ok(())
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.tree()
            .await?
            .flush_async()
            .await
            .map_err(|e| ComandaSyncError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }
}

/// 按 [`KvStore::set`] 相同的格式编码值，供 [`KvStore::insert_batch`] 使用
pub fn encode<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ComandaSyncError::Serialization(format!("序列化值失败: {}", e)))
}

fn is_lock_contention(err: &sled::Error) -> bool {
    match err {
        sled::Error::Io(io) => io.kind() == std::io::ErrorKind::WouldBlock || io.to_string().contains("lock"),
        other => other.to_string().contains("could not acquire lock"),
    }
}

/// 打开 sled，文件锁被占用时指数退避重试
async fn open_with_retry(path: &Path) -> Result<Db> {
    let mut attempt = 0;
    loop {
        match sled::open(path) {
            Ok(db) => return Ok(db),
            Err(e) if is_lock_contention(&e) && attempt + 1 < OPEN_ATTEMPTS => {
                let delay = OPEN_BACKOFF_BASE * 2u32.pow(attempt);
                debug!("sled 文件锁被占用，{}ms 后重试: {}", delay.as_millis(), e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(ComandaSyncError::KvStore(format!("打开 sled 数据库失败: {}", e))),
        }
    }
}

/// 离线队列使用的键
pub mod keys {
    /// 离线动作前缀（键格式 `offline_actions:{id:020}`）
    pub const OFFLINE_ACTIONS: &str = "offline_actions";
    /// 已分配的最大动作 ID
    pub const LAST_ACTION_ID: &str = "offline_meta:last_action_id";
    /// 队列落盘格式版本
    pub const QUEUE_FORMAT: &str = "offline_meta:format_version";
    /// 累计入队数量
    pub const ENQUEUED_TOTAL: &str = "offline_meta:enqueued_total";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, tenant: &str) -> KvStore {
        let store = KvStore::new(dir.path()).await.unwrap();
        store.switch_tenant(tenant).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "loja_centro").await;

        let value = json!({"name": "test", "value": 123});
        store.set("k", &value).await.unwrap();
        let read: serde_json::Value = store.get("k").await.unwrap().unwrap();
        assert_eq!(read, value);

        assert!(store.delete("k").await.unwrap().is_some());
        assert!(store.get::<_, serde_json::Value>("k").await.unwrap().is_none());
        // 删除不存在的键不报错
        assert!(store.delete("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requires_tenant() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.path()).await.unwrap();

        assert!(store.current_tenant().await.is_none());
        let result = store.set("key", &1u64).await;
        assert!(matches!(result, Err(ComandaSyncError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "a").await;
        store.set("shared", &"from a").await.unwrap();

        store.switch_tenant("b").await.unwrap();
        assert_eq!(store.current_tenant().await.as_deref(), Some("b"));
        assert!(store.get::<_, String>("shared").await.unwrap().is_none());

        store.switch_tenant("a").await.unwrap();
        assert_eq!(store.get::<_, String>("shared").await.unwrap().as_deref(), Some("from a"));
    }

    #[tokio::test]
    async fn test_scan_and_remove_prefix() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "t").await;

        for i in [3, 1, 2] {
            store.set(format!("p:{}", i), &json!({"value": i})).await.unwrap();
        }
        store.set("other", &json!(0)).await.unwrap();

        let results = store.scan_prefix_raw(b"p:").await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, b"p:1".to_vec());

        assert_eq!(store.remove_prefix(b"p:").await.unwrap(), 3);
        assert!(store.scan_prefix_raw(b"p:").await.unwrap().is_empty());
        assert!(store.get::<_, i64>("other").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_insert_batch_writes_all_entries() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "t").await;

        store
            .insert_batch(vec![
                ("a", encode(&json!({"id": 1})).unwrap()),
                ("b", encode(&7u64).unwrap()),
            ])
            .await
            .unwrap();

        assert_eq!(store.get::<_, serde_json::Value>("a").await.unwrap(), Some(json!({"id": 1})));
        assert_eq!(store.get::<_, u64>("b").await.unwrap(), Some(7));
        store.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open(&dir, "t").await;
            store.set("k", &42u64).await.unwrap();
            store.flush().await.unwrap();
        }
        let store = open(&dir, "t").await;
        assert_eq!(store.get::<_, u64>("k").await.unwrap(), Some(42));
    }
}
