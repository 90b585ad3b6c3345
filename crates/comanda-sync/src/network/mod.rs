//! 连接状态监控
//!
//! 平台层通过 [`NetworkStatusListener`] 上报链路状态；[`ConnectivityMonitor`]
//! 维护 `is_online` / `was_offline` 并广播上下线边沿事件。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// 默认“刚恢复连接”提示时长
pub const DEFAULT_RECONNECT_NOTICE_MS: u64 = 3000;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 网络受限（按在线处理，由后端请求结果决定成败）
    Limited,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: u64,
}

impl NetworkStatusEvent {
    pub fn new(old_status: NetworkStatus, new_status: NetworkStatus) -> Self {
        Self {
            old_status,
            new_status,
            timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
        }
    }
}

/// 网络状态监听器trait（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 连接状态边沿事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// 在线 → 离线
    WentOffline,
    /// 离线 → 在线（链路层信号）
    CameBackOnline,
    /// 应用层确认后端可达
    BackOnlineSignal,
}

/// 当前连接状态（不持久化）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// 刚从离线恢复，仅用于界面提示
    pub was_offline: bool,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self { is_online: true, was_offline: false }
    }
}

#[derive(Debug)]
struct MonitorShared {
    state: RwLock<ConnectivityState>,
    event_sender: broadcast::Sender<ConnectivityEvent>,
    reconnect_notice: Duration,
    /// 每次恢复连接递增，旧的清除定时器不会清掉新的提示窗口
    notice_epoch: AtomicU64,
}

impl MonitorShared {
    fn apply(self: &Arc<Self>, online: bool) -> Option<ConnectivityEvent> {
        {
            let mut state = self.state.write();
            if state.is_online == online {
                return None;
            }
            state.is_online = online;
            state.was_offline = online;
        }

        let event = if online {
            self.start_notice_window();
            ConnectivityEvent::CameBackOnline
        } else {
            self.notice_epoch.fetch_add(1, Ordering::SeqCst);
            ConnectivityEvent::WentOffline
        };

        info!("连接状态变化: {:?}", event);
        let _ = self.event_sender.send(event);
        Some(event)
    }

    fn start_notice_window(self: &Arc<Self>) {
        let epoch = self.notice_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.reconnect_notice).await;
            if shared.notice_epoch.load(Ordering::SeqCst) == epoch {
                shared.state.write().was_offline = false;
                debug!("恢复连接提示窗口结束");
            }
        });
    }
}

/// 连接状态监控器
#[derive(Debug)]
pub struct ConnectivityMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    shared: Arc<MonitorShared>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityMonitor {
    pub fn new(listener: Option<Arc<dyn NetworkStatusListener>>, reconnect_notice: Duration) -> Self {
        let (event_sender, _) = broadcast::channel(64);

        Self {
            listener,
            shared: Arc::new(MonitorShared {
                state: RwLock::new(ConnectivityState::default()),
                event_sender,
                reconnect_notice,
                notice_epoch: AtomicU64::new(0),
            }),
            watch_task: Mutex::new(None),
        }
    }

    /// 启动监控：读取当前状态并订阅平台监听器
    pub async fn start(&self) -> Result<()> {
        let Some(listener) = &self.listener else {
            debug!("未配置网络状态监听器，仅支持手动更新状态");
            return Ok(());
        };

        let current = listener.get_current_status().await;
        self.shared.apply(current.is_online());

        let mut receiver = listener.start_monitoring().await?;
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        shared.apply(event.new_status.is_online());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("网络状态事件滞后，跳过 {} 条", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("网络状态监听结束");
        });

        if let Some(old) = self.watch_task.lock().replace(handle) {
            old.abort();
        }

        info!("连接状态监控已启动, 当前状态: {:?}", current);
        Ok(())
    }

    /// 停止监控
    pub async fn stop(&self) {
        let handle = self.watch_task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(listener) = &self.listener {
            listener.stop_monitoring().await;
        }
    }

    /// 手动设置网络状态（无监听器的平台或测试）
    pub fn set_status(&self, status: NetworkStatus) -> Option<ConnectivityEvent> {
        self.shared.apply(status.is_online())
    }

    /// 应用层确认后端已可达
    ///
    /// 强制切换为在线但不发送 `CameBackOnline`，只发送 `BackOnlineSignal`。
    pub fn signal_back_online(&self) {
        let was_offline = {
            let mut state = self.shared.state.write();
            let was_offline = !state.is_online;
            state.is_online = true;
            if was_offline {
                state.was_offline = true;
            }
            was_offline
        };
        if was_offline {
            self.shared.start_notice_window();
        }

        info!("收到后端恢复可达信号");
        let _ = self.shared.event_sender.send(ConnectivityEvent::BackOnlineSignal);
    }

    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.read()
    }

    pub fn is_online(&self) -> bool {
        self.shared.state.read().is_online
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.shared.event_sender.subscribe()
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.watch_task.get_mut().take() {
            handle.abort();
        }
    }
}
