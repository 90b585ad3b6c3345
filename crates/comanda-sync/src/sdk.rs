//! 离线同步入口
//!
//! [`OfflineSync`] 组装离线队列、连接监控、同步器、事件和生命周期管理。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::{ComandaSyncError, Result};
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::http_client::RestBackingStore;
use crate::lifecycle::{LifecycleManager, SyncLifecycleHook, Visibility};
use crate::network::{ConnectivityMonitor, ConnectivityState, NetworkStatus, NetworkStatusListener};
use crate::notify::{NotificationSink, SyncNotifier};
use crate::storage::queue::{ActionKind, OfflineQueue, QueueStats, QueuedAction};
use crate::store::{BackingStore, ReplayCommand};
use crate::sync::{SyncMetrics, SyncReport, SyncTrigger, SyncTriggerLoop, Synchronizer};

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// 已直接写入后端
    Applied,
    /// 已进入离线队列，稍后同步
    Queued(u64),
}

/// 离线同步主入口
pub struct OfflineSync {
    config: SyncConfig,
    queue: Arc<OfflineQueue>,
    store: Arc<dyn BackingStore>,
    monitor: Arc<ConnectivityMonitor>,
    synchronizer: Arc<Synchronizer>,
    event_manager: Arc<EventManager>,
    lifecycle_manager: RwLock<LifecycleManager>,
    trigger_loop: SyncTriggerLoop,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for OfflineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSync")
            .field("tenant_id", &self.config.tenant_id)
            .field("durable", &self.queue.is_durable())
            .field("connectivity", &self.monitor.state())
            .finish()
    }
}

impl OfflineSync {
    /// 初始化
    ///
    /// - `store`: 为 None 时根据 `config.store` 创建 REST 客户端
    /// - `listener`: 平台网络状态监听器，为 None 时需手动调用 [`OfflineSync::set_network_status`]
    /// - `notification_sink`: 平台通知接口，可选
    pub async fn initialize(
        config: SyncConfig,
        store: Option<Arc<dyn BackingStore>>,
        listener: Option<Arc<dyn NetworkStatusListener>>,
        notification_sink: Option<Arc<dyn NotificationSink>>,
    ) -> Result<Arc<Self>> {
        crate::logging::init_tracing(config.debug_mode);
        info!("正在初始化离线同步 (租户: {})... {}", config.tenant_id, crate::version::version_summary());

        config.validate()?;

        let store: Arc<dyn BackingStore> = match store {
            Some(store) => store,
            None => {
                let store_config = config
                    .store
                    .as_ref()
                    .ok_or_else(|| ComandaSyncError::Config("未配置后端存储".to_string()))?;
                Arc::new(RestBackingStore::new(store_config)?)
            }
        };

        // 第1层：离线队列
        let queue = Arc::new(OfflineQueue::open(&config).await);
        if !queue.is_durable() {
            warn!("离线队列仅在内存中，进程退出后未同步的动作会丢失");
        }

        // 第2层：连接监控与事件
        let monitor = Arc::new(ConnectivityMonitor::new(listener, config.reconnect_notice()));
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));

        // 第3层：同步器
        let notifier = SyncNotifier::new(notification_sink, config.notifications_enabled);
        let synchronizer = Arc::new(Synchronizer::new(
            queue.clone(),
            store.clone(),
            monitor.clone(),
            event_manager.clone(),
            notifier,
            &config,
        ));

        // 第4层：自动触发（先订阅再启动监控）
        let trigger_loop = SyncTriggerLoop::spawn(
            synchronizer.clone(),
            monitor.clone(),
            event_manager.clone(),
            config.settle_delay(),
        );
        monitor.start().await?;

        // 第5层：生命周期
        let mut lifecycle_manager = LifecycleManager::new();
        lifecycle_manager.register(Arc::new(SyncLifecycleHook::new(synchronizer.clone(), monitor.clone())));

        info!(
            "✅ 离线同步初始化完成 (待同步: {}, 在线: {})",
            queue.len().await,
            monitor.is_online()
        );

        Ok(Arc::new(Self {
            config,
            queue,
            store,
            monitor,
            synchronizer,
            event_manager,
            lifecycle_manager: RwLock::new(lifecycle_manager),
            trigger_loop,
            shutting_down: AtomicBool::new(false),
        }))
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ComandaSyncError::ShuttingDown("离线同步正在关闭".to_string()));
        }
        Ok(())
    }

    /// 离线优先写入
    ///
    /// 在线时直接写后端，失败或离线时进入离线队列。集合与记录 ID 在入口处校验，非法写入直接返回错误。
    pub async fn submit(&self, kind: ActionKind, target: &str, payload: Map<String, Value>) -> Result<SubmitOutcome> {
        self.check_running()?;

        let probe = QueuedAction::new(0, kind, target, payload);
        let command = ReplayCommand::from_action(&probe)?;

        if self.monitor.is_online() {
            let direct = tokio::time::timeout(self.config.entry_timeout(), command.dispatch(self.store.as_ref())).await;
            match direct {
                Ok(Ok(())) => return Ok(SubmitOutcome::Applied),
                Ok(Err(e)) => warn!("直接写入失败，转入离线队列: {} {} ({})", kind, target, e),
                Err(_) => warn!("直接写入超时，转入离线队列: {} {}", kind, target),
            }
        }

        let id = self.enqueue(kind, target, probe.payload).await?;
        Ok(SubmitOutcome::Queued(id))
    }

    /// 直接加入离线队列（不校验集合）
    pub async fn enqueue(&self, kind: ActionKind, target: &str, payload: Map<String, Value>) -> Result<u64> {
        self.check_running()?;
        let id = self.queue.enqueue(kind, target, payload).await?;
        self.event_manager
            .emit(event_builders::action_queued(id, target, kind))
            .await;
        Ok(id)
    }

    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.queue.list_pending().await
    }

    pub async fn pending_count(&self) -> usize {
        self.queue.len().await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// 手动触发同步
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.check_running()?;
        Ok(self.synchronizer.run(SyncTrigger::Manual).await)
    }

    pub fn is_syncing(&self) -> bool {
        self.synchronizer.is_syncing()
    }

    pub fn sync_metrics(&self) -> SyncMetrics {
        self.synchronizer.metrics()
    }

    /// App 回到前台
    pub async fn on_visible(&self) -> Result<()> {
        self.check_running()?;
        self.lifecycle_manager.read().await.dispatch(Visibility::Visible).await
    }

    /// App 切到后台
    pub async fn on_hidden(&self) -> Result<()> {
        self.lifecycle_manager.read().await.dispatch(Visibility::Hidden).await
    }

    pub async fn lifecycle_manager(&self) -> tokio::sync::RwLockWriteGuard<'_, LifecycleManager> {
        self.lifecycle_manager.write().await
    }

    /// 应用层确认后端可达
    pub fn signal_back_online(&self) {
        self.monitor.signal_back_online();
    }

    /// 手动更新网络状态（无平台监听器时使用）
    pub fn set_network_status(&self, status: NetworkStatus) {
        self.monitor.set_status(status);
    }

    pub fn connectivity(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_manager.subscribe()
    }

    pub fn event_manager(&self) -> Arc<EventManager> {
        self.event_manager.clone()
    }

    /// 清空离线队列（仅维护用途，未同步的动作会丢失）
    pub async fn clear_queue(&self) -> Result<usize> {
        warn!("清空离线队列");
        let cleared = self.queue.clear_all().await?;
        self.synchronizer.reset_failure_streaks();
        Ok(cleared)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 关闭：停止自动触发与监控，等待进行中的同步结束
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭离线同步...");

        self.trigger_loop.stop().await;
        self.monitor.stop().await;
        self.synchronizer.wait_idle().await;
        self.event_manager.clear_listeners();

        info!("离线同步关闭完成 (剩余待同步: {})", self.queue.len().await);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
