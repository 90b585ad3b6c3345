//! 离线动作队列
//!
//! 两级存储：
//! - 主存储：sled 持久化队列，进程重启后仍可恢复
//! - 降级存储：有容量上限的内存队列，主存储不可用或单次写入失败时使用
//!
//! 两级都不可用时丢弃动作并记录 error 日志，不会静默丢失。

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{ComandaSyncError, Result};
use crate::storage::kv::{encode, keys, KvStore};
use crate::version::QUEUE_FORMAT_VERSION;

pub mod action;

pub use action::{sort_for_replay, ActionKind, QueuedAction};

/// 默认内存降级队列容量
pub const DEFAULT_FALLBACK_CAPACITY: usize = 500;

/// 队列统计信息（状态徽标使用）
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// 主存储是否可用
    pub durable: bool,
    pub primary_count: usize,
    pub fallback_count: usize,
    pub fallback_capacity: usize,
    pub by_kind: HashMap<ActionKind, usize>,
    /// 最早一条待同步动作的停留时长
    pub oldest_age_ms: Option<i64>,
    /// 本进程内入队数量
    pub session_enqueued: u64,
    /// 主存储记录的累计入队数量
    pub lifetime_enqueued: Option<u64>,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.primary_count + self.fallback_count
    }
}

#[async_trait::async_trait]
pub trait ActionQueueTrait: Debug + Send + Sync {
    async fn push(&self, action: QueuedAction) -> Result<()>;
    /// 返回全部动作，不消费
    async fn list(&self) -> Result<Vec<QueuedAction>>;
    /// 删除指定动作，返回是否存在
    async fn remove(&self, id: u64) -> Result<bool>;
    async fn clear(&self) -> Result<usize>;
    async fn size(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.size().await? == 0)
    }

    /// 已分配过的最大 ID（持久化存储跨重启保留）
    async fn last_assigned_id(&self) -> Result<u64> {
        Ok(0)
    }

    async fn lifetime_enqueued(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// 基于内存的有界队列
#[derive(Debug)]
pub struct MemoryActionQueue {
    actions: Arc<RwLock<Vec<QueuedAction>>>,
    capacity: usize,
}

impl MemoryActionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            actions: Arc::new(RwLock::new(Vec::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait::async_trait]
impl ActionQueueTrait for MemoryActionQueue {
    async fn push(&self, action: QueuedAction) -> Result<()> {
        let mut actions = self.actions.write().await;
        if actions.len() >= self.capacity {
            return Err(ComandaSyncError::QueueFull(format!(
                "内存队列已满 (容量 {})",
                self.capacity
            )));
        }
        actions.push(action);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueuedAction>> {
        Ok(self.actions.read().await.clone())
    }

    async fn remove(&self, id: u64) -> Result<bool> {
        let mut actions = self.actions.write().await;
        let before = actions.len();
        actions.retain(|a| a.id != id);
        Ok(actions.len() != before)
    }

    async fn clear(&self) -> Result<usize> {
        let mut actions = self.actions.write().await;
        let count = actions.len();
        actions.clear();
        Ok(count)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.actions.read().await.len())
    }
}

/// 基于 sled 的持久化队列
#[derive(Debug)]
pub struct PersistentActionQueue {
    kv_store: Arc<KvStore>,
    queue_key: String,
}

impl PersistentActionQueue {
    /// 打开租户的持久化队列
    pub async fn open(data_dir: &Path, tenant_id: &str) -> Result<Self> {
        let kv_store = KvStore::new(data_dir).await?;
        kv_store.switch_tenant(tenant_id).await?;
        Self::with_store(Arc::new(kv_store)).await
    }

    /// 使用已切换好租户的 KV 存储
    pub async fn with_store(kv_store: Arc<KvStore>) -> Result<Self> {
        let queue = Self {
            kv_store,
            queue_key: keys::OFFLINE_ACTIONS.to_string(),
        };
        queue.check_format().await?;
        Ok(queue)
    }

    async fn check_format(&self) -> Result<()> {
        let stored: Option<u32> = self.kv_store.get(keys::QUEUE_FORMAT).await?;
        match stored {
            None => {
                self.kv_store.set(keys::QUEUE_FORMAT, &QUEUE_FORMAT_VERSION).await?;
                Ok(())
            }
            Some(v) if v <= QUEUE_FORMAT_VERSION => Ok(()),
            Some(v) => Err(ComandaSyncError::KvStore(format!(
                "不支持的队列格式版本: {} (当前 {})",
                v, QUEUE_FORMAT_VERSION
            ))),
        }
    }

    fn action_key(&self, id: u64) -> String {
        format!("{}:{:020}", self.queue_key, id)
    }

    fn prefix(&self) -> String {
        format!("{}:", self.queue_key)
    }
}

#[async_trait::async_trait]
impl ActionQueueTrait for PersistentActionQueue {
    async fn push(&self, action: QueuedAction) -> Result<()> {
        let key = self.action_key(action.id);
        let last: u64 = self.kv_store.get(keys::LAST_ACTION_ID).await?.unwrap_or(0);
        let total: i64 = self.kv_store.get(keys::ENQUEUED_TOTAL).await?.unwrap_or(0);

        // 动作与 ID 水位、累计计数一起落盘
        self.kv_store
            .insert_batch(vec![
                (key.as_str(), encode(&action)?),
                (keys::LAST_ACTION_ID, encode(&last.max(action.id))?),
                (keys::ENQUEUED_TOTAL, encode(&(total + 1))?),
            ])
            .await?;

        if let Err(e) = self.kv_store.flush().await {
            // 调用方会改写内存队列，动作不能同时留在主存储
            if let Err(undo) = self.kv_store.delete(&key).await {
                error!("撤回未刷盘的离线动作失败 {}: {}", action.describe(), undo);
            }
            return Err(e);
        }

        debug!("离线动作已持久化: {}", action.describe());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<QueuedAction>> {
        let raw = self.kv_store.scan_prefix_raw(self.prefix().as_bytes()).await?;
        let mut actions = Vec::with_capacity(raw.len());

        for (key, value) in raw {
            match serde_json::from_slice::<QueuedAction>(&value) {
                Ok(action) => actions.push(action),
                Err(e) => {
                    warn!("跳过损坏的离线动作 {}: {}", String::from_utf8_lossy(&key), e);
                }
            }
        }

        Ok(actions)
    }

    async fn remove(&self, id: u64) -> Result<bool> {
        let removed = self.kv_store.delete(self.action_key(id)).await?;
        if removed.is_some() {
            self.kv_store.flush().await?;
        }
        Ok(removed.is_some())
    }

    async fn clear(&self) -> Result<usize> {
        let removed = self.kv_store.remove_prefix(self.prefix().as_bytes()).await?;
        self.kv_store.flush().await?;
        Ok(removed as usize)
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.kv_store.scan_prefix_raw(self.prefix().as_bytes()).await?.len())
    }

    async fn last_assigned_id(&self) -> Result<u64> {
        let last: Option<u64> = self.kv_store.get(keys::LAST_ACTION_ID).await?;
        Ok(last.unwrap_or(0))
    }

    async fn lifetime_enqueued(&self) -> Result<Option<u64>> {
        let total: Option<i64> = self.kv_store.get(keys::ENQUEUED_TOTAL).await?;
        Ok(total.map(|t| t.max(0) as u64))
    }
}

/// 离线队列：主存储 + 内存降级
#[derive(Debug)]
pub struct OfflineQueue {
    primary: Option<Arc<dyn ActionQueueTrait>>,
    fallback: MemoryActionQueue,
    /// 下一个待分配的 ID，入队期间持锁，保证 ID 按插入顺序递增
    next_id: Mutex<u64>,
    session_enqueued: AtomicU64,
}

impl OfflineQueue {
    /// 按配置打开队列；主存储打开失败时只使用内存队列
    pub async fn open(config: &SyncConfig) -> Self {
        let primary = match PersistentActionQueue::open(&config.data_dir, &config.tenant_id).await {
            Ok(queue) => Some(Arc::new(queue) as Arc<dyn ActionQueueTrait>),
            Err(e) => {
                warn!("离线队列主存储不可用，降级为内存队列: {}", e);
                None
            }
        };
        Self::with_tiers(primary, config.fallback_capacity).await
    }

    pub async fn with_tiers(primary: Option<Arc<dyn ActionQueueTrait>>, fallback_capacity: usize) -> Self {
        let mut last_id = 0u64;
        if let Some(primary) = &primary {
            match primary.last_assigned_id().await {
                Ok(id) => last_id = id,
                Err(e) => warn!("读取离线动作 ID 水位失败: {}", e),
            }
            match primary.list().await {
                Ok(actions) => {
                    if let Some(max) = actions.iter().map(|a| a.id).max() {
                        last_id = last_id.max(max);
                    }
                    if !actions.is_empty() {
                        info!("恢复 {} 条待同步的离线动作", actions.len());
                    }
                }
                Err(e) => warn!("读取离线队列失败: {}", e),
            }
        }

        Self {
            primary,
            fallback: MemoryActionQueue::new(fallback_capacity),
            next_id: Mutex::new(last_id + 1),
            session_enqueued: AtomicU64::new(0),
        }
    }

    /// 仅内存队列（测试、无磁盘环境）
    pub async fn memory_only(capacity: usize) -> Self {
        Self::with_tiers(None, capacity).await
    }

    /// 主存储是否可用
    pub fn is_durable(&self) -> bool {
        self.primary.is_some()
    }

    /// 记录一条离线动作，返回分配的 ID
    ///
    /// 不校验 target；两级存储都写入失败时返回 `QueueFull`。
    pub async fn enqueue(&self, kind: ActionKind, target: &str, payload: Map<String, Value>) -> Result<u64> {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;

        let action = QueuedAction::new(id, kind, target, payload);

        if let Some(primary) = &self.primary {
            match primary.push(action.clone()).await {
                Ok(()) => {
                    self.session_enqueued.fetch_add(1, Ordering::Relaxed);
                    debug!("离线动作入队: {}", action.describe());
                    return Ok(id);
                }
                Err(e) => {
                    warn!("离线动作写入主存储失败，改用内存队列: {} ({})", action.describe(), e);
                    // 写入可能已部分生效
                    if let Err(undo) = primary.remove(id).await {
                        debug!("清理主存储中的 #{} 失败: {}", id, undo);
                    }
                }
            }
        }

        match self.fallback.push(action).await {
            Ok(()) => {
                self.session_enqueued.fetch_add(1, Ordering::Relaxed);
                debug!("离线动作入队(内存): #{} {} {}", id, kind, target);
                Ok(id)
            }
            Err(e) => {
                error!(kind = %kind, collection = %target, "离线动作无法保存，已丢弃: {}", e);
                Err(e)
            }
        }
    }

    /// 所有待同步动作，按 (created_at, id) 升序，每个 ID 只出现一次
    ///
    /// 读取失败的存储层按空处理，不向调用方返回错误。
    pub async fn list_pending(&self) -> Vec<QueuedAction> {
        let mut actions = Vec::new();

        if let Some(primary) = &self.primary {
            match primary.list().await {
                Ok(list) => actions.extend(list),
                Err(e) => error!("读取离线队列主存储失败: {}", e),
            }
        }
        match self.fallback.list().await {
            Ok(list) => {
                let seen: HashSet<u64> = actions.iter().map(|a| a.id).collect();
                for action in list {
                    if seen.contains(&action.id) {
                        warn!("动作同时存在于两级存储，以主存储为准: #{}", action.id);
                    } else {
                        actions.push(action);
                    }
                }
            }
            Err(e) => error!("读取内存离线队列失败: {}", e),
        }

        sort_for_replay(&mut actions);
        actions
    }

    /// 删除动作；ID 不存在不视为错误
    pub async fn remove(&self, id: u64) -> Result<()> {
        let primary_result = match &self.primary {
            Some(primary) => primary.remove(id).await,
            None => Ok(false),
        };
        let in_fallback = self.fallback.remove(id).await.unwrap_or(false);

        match primary_result {
            Err(e) if !in_fallback => Err(e),
            _ => Ok(()),
        }
    }

    /// 清空所有待同步动作（仅维护用途）
    pub async fn clear_all(&self) -> Result<usize> {
        let mut cleared = 0;
        if let Some(primary) = &self.primary {
            cleared += primary.clear().await?;
        }
        cleared += self.fallback.clear().await?;
        info!("离线队列已清空: {} 条", cleared);
        Ok(cleared)
    }

    pub async fn len(&self) -> usize {
        let primary = match &self.primary {
            Some(primary) => primary.size().await.unwrap_or(0),
            None => 0,
        };
        primary + self.fallback.size().await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            durable: self.is_durable(),
            fallback_capacity: self.fallback.capacity(),
            session_enqueued: self.session_enqueued.load(Ordering::Relaxed),
            ..Default::default()
        };

        let mut all = Vec::new();
        if let Some(primary) = &self.primary {
            if let Ok(list) = primary.list().await {
                stats.primary_count = list.len();
                all.extend(list);
            }
            stats.lifetime_enqueued = primary.lifetime_enqueued().await.ok().flatten();
        }
        if let Ok(list) = self.fallback.list().await {
            stats.fallback_count = list.len();
            all.extend(list);
        }

        for action in &all {
            *stats.by_kind.entry(action.kind).or_insert(0) += 1;
        }
        stats.oldest_age_ms = all.iter().map(|a| a.age_ms()).max();
        stats
    }
}
