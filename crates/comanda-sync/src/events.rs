//! 同步事件
//!
//! 界面层通过 [`EventManager`] 订阅连接变化、同步批次和离线动作状态。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::storage::queue::ActionKind;
use crate::sync::SyncTrigger;

/// 同步相关事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 连接状态变化
    ConnectivityChanged { is_online: bool, timestamp: u64 },
    /// 一次同步开始
    SyncStarted {
        run_id: String,
        trigger: SyncTrigger,
        pending: usize,
        timestamp: u64,
    },
    /// 一次同步结束
    SyncCompleted {
        run_id: String,
        trigger: SyncTrigger,
        success_count: usize,
        failed_count: usize,
        timestamp: u64,
    },
    /// 新的离线动作入队
    ActionQueued {
        id: u64,
        target: String,
        kind: ActionKind,
        timestamp: u64,
    },
    /// 动作连续失败达到阈值（不会被删除，仍会继续重试）
    ActionStuck {
        id: u64,
        target: String,
        kind: ActionKind,
        failures: u32,
        last_error: String,
        timestamp: u64,
    },
}

impl SyncEvent {
    /// 获取事件类型
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::ActionQueued { .. } => "action_queued",
            SyncEvent::ActionStuck { .. } => "action_stuck",
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::ConnectivityChanged { timestamp, .. }
            | SyncEvent::SyncStarted { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::ActionQueued { timestamp, .. }
            | SyncEvent::ActionStuck { timestamp, .. } => *timestamp,
        }
    }

    /// 事件关联的离线动作 ID
    pub fn action_id(&self) -> Option<u64> {
        match self {
            SyncEvent::ActionQueued { id, .. } | SyncEvent::ActionStuck { id, .. } => Some(*id),
            _ => None,
        }
    }
}

/// 事件构造辅助函数
pub mod event_builders {
    use super::*;

    fn now_ms() -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }

    pub fn connectivity_changed(is_online: bool) -> SyncEvent {
        SyncEvent::ConnectivityChanged { is_online, timestamp: now_ms() }
    }

    pub fn sync_started(run_id: &str, trigger: SyncTrigger, pending: usize) -> SyncEvent {
        SyncEvent::SyncStarted {
            run_id: run_id.to_string(),
            trigger,
            pending,
            timestamp: now_ms(),
        }
    }

    pub fn sync_completed(run_id: &str, trigger: SyncTrigger, success_count: usize, failed_count: usize) -> SyncEvent {
        SyncEvent::SyncCompleted {
            run_id: run_id.to_string(),
            trigger,
            success_count,
            failed_count,
            timestamp: now_ms(),
        }
    }

    pub fn action_queued(id: u64, target: &str, kind: ActionKind) -> SyncEvent {
        SyncEvent::ActionQueued {
            id,
            target: target.to_string(),
            kind,
            timestamp: now_ms(),
        }
    }

    pub fn action_stuck(id: u64, target: &str, kind: ActionKind, failures: u32, last_error: &str) -> SyncEvent {
        SyncEvent::ActionStuck {
            id,
            target: target.to_string(),
            kind,
            failures,
            last_error: last_error.to_string(),
            timestamp: now_ms(),
        }
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 监听器登记：`filter` 为 None 时接收全部事件
struct Registration {
    filter: Option<String>,
    callback: EventListener,
}

impl Registration {
    fn accepts(&self, event: &SyncEvent) -> bool {
        self.filter.as_deref().map_or(true, |t| t == event.event_type())
    }
}

#[derive(Default)]
struct Registry {
    listeners: Vec<Registration>,
    stats: EventStats,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

/// 事件管理器
///
/// 事件同时走两条路：broadcast 订阅者（异步消费）和同步回调监听器。
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    registry: RwLock<Registry>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.registry.read().listeners.len())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        let kind = event.event_type();
        debug!("发布事件: {}", kind);

        {
            let mut registry = self.registry.write();
            let stats = &mut registry.stats;
            stats.total_events += 1;
            *stats.events_by_type.entry(kind.to_string()).or_default() += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 返回 Err，属正常情况
        let delivered = self.sender.send(event.clone()).unwrap_or(0);

        // 回调在锁外执行，回调内可以再注册或清除监听器
        let matched: Vec<EventListener> = self
            .registry
            .read()
            .listeners
            .iter()
            .filter(|r| r.accepts(&event))
            .map(|r| r.callback.clone())
            .collect();
        for callback in &matched {
            callback(&event);
        }
        let called = matched.len();
        trace!(event = kind, delivered, called, "事件已分发");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 添加事件监听器，`"*"` 监听全部类型
    pub fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let filter = (event_type != "*").then(|| event_type.to_string());
        let mut registry = self.registry.write();
        registry.listeners.push(Registration {
            filter,
            callback: Arc::new(listener),
        });
        registry.stats.listener_count = registry.listeners.len();
        info!("事件监听器已添加: {}", event_type);
    }

    pub fn clear_listeners(&self) {
        let mut registry = self.registry.write();
        registry.listeners.clear();
        registry.stats.listener_count = 0;
    }

    pub fn stats(&self) -> EventStats {
        self.registry.read().stats.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_listeners_by_type() {
        let manager = EventManager::new(16);
        let stuck = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));

        let stuck_clone = stuck.clone();
        manager.add_listener("action_stuck", move |_event| {
            stuck_clone.fetch_add(1, Ordering::SeqCst);
        });
        let all_clone = all.clone();
        manager.add_listener("*", move |_event| {
            all_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(event_builders::action_queued(1, "sales", ActionKind::Insert)).await;
        manager
            .emit(event_builders::action_stuck(1, "sales", ActionKind::Insert, 5, "boom"))
            .await;

        assert_eq!(stuck.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);

        let stats = manager.stats();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.listener_count, 2);
        assert_eq!(stats.events_by_type.get("action_queued"), Some(&1));
    }

    #[tokio::test]
    async fn test_listener_may_modify_registry() {
        let manager = Arc::new(EventManager::new(16));
        let inner = Arc::new(AtomicUsize::new(0));

        let registry = manager.clone();
        let inner_clone = inner.clone();
        manager.add_listener("action_queued", move |_event| {
            let counter = inner_clone.clone();
            registry.add_listener("*", move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        manager.emit(event_builders::action_queued(1, "sales", ActionKind::Insert)).await;
        assert_eq!(manager.stats().listener_count, 2);

        manager.emit(event_builders::connectivity_changed(true)).await;
        assert_eq!(inner.load(Ordering::SeqCst), 1);

        manager.clear_listeners();
        assert_eq!(manager.stats().listener_count, 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 1);

        manager
            .emit(event_builders::sync_completed("run-1", SyncTrigger::Manual, 2, 1))
            .await;

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "sync_completed");
        assert!(event.timestamp() > 0);
        assert_eq!(event.action_id(), None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = event_builders::connectivity_changed(false);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "connectivity_changed");
        assert_eq!(value["is_online"], false);
    }
}
