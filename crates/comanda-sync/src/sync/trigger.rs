use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::select;
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::events::{event_builders, EventManager};
use crate::network::{ConnectivityEvent, ConnectivityMonitor};
use crate::sync::{Synchronizer, SyncTrigger};

/// 自动同步触发器
///
/// 监听连接事件：
/// - `CameBackOnline`：等待 `settle_delay` 后仍在线才同步
/// - `BackOnlineSignal`：立即同步
///
/// 派生的同步任务由触发循环持有，停止时取消尚在等待的任务并等待进行中的同步结束。
#[derive(Debug)]
pub struct SyncTriggerLoop {
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// 触发循环共享的上下文
struct TriggerContext {
    synchronizer: Arc<Synchronizer>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    settle_delay: Duration,
    stop_rx: watch::Receiver<bool>,
}

impl SyncTriggerLoop {
    /// 启动触发循环；需在 `ConnectivityMonitor::start` 之前调用以免漏掉初始事件
    pub fn spawn(
        synchronizer: Arc<Synchronizer>,
        monitor: Arc<ConnectivityMonitor>,
        events: Arc<EventManager>,
        settle_delay: Duration,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut receiver = monitor.subscribe();
        let mut stop = stop_rx.clone();
        let ctx = TriggerContext {
            synchronizer,
            monitor,
            events,
            settle_delay,
            stop_rx,
        };

        let handle = tokio::spawn(async move {
            info!("同步触发器已启动 (settle_delay={}ms)", settle_delay.as_millis());
            let mut tasks = JoinSet::new();
            loop {
                select! {
                    _ = stop.changed() => {
                        debug!("同步触发器收到停止信号");
                        break;
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            warn!("同步任务异常退出: {}", e);
                        }
                    }
                    event = receiver.recv() => {
                        match event {
                            Ok(event) => ctx.handle_event(event, &mut tasks).await,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("连接事件滞后，跳过 {} 条", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }

            if !tasks.is_empty() {
                debug!("等待 {} 个同步任务结束", tasks.len());
            }
            while tasks.join_next().await.is_some() {}
            info!("同步触发器已停止");
        });

        Self {
            stop_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// 停止触发循环；返回时不再有由本触发器派生的同步在运行
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("同步触发器异常退出: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl TriggerContext {
    async fn handle_event(&self, event: ConnectivityEvent, tasks: &mut JoinSet<()>) {
        match event {
            ConnectivityEvent::WentOffline => {
                self.events.emit(event_builders::connectivity_changed(false)).await;
            }
            ConnectivityEvent::CameBackOnline => {
                self.events.emit(event_builders::connectivity_changed(true)).await;

                let synchronizer = self.synchronizer.clone();
                let monitor = self.monitor.clone();
                let settle_delay = self.settle_delay;
                let mut stop = self.stop_rx.clone();
                tasks.spawn(async move {
                    select! {
                        _ = tokio::time::sleep(settle_delay) => {}
                        _ = stop.changed() => {
                            debug!("触发器已停止，取消待执行的同步");
                            return;
                        }
                    }
                    if monitor.is_online() {
                        synchronizer.run(SyncTrigger::Online).await;
                    } else {
                        debug!("等待期间再次离线，取消同步");
                    }
                });
            }
            ConnectivityEvent::BackOnlineSignal => {
                let synchronizer = self.synchronizer.clone();
                tasks.spawn(async move {
                    synchronizer.run(SyncTrigger::BackOnlineSignal).await;
                });
            }
        }
    }
}

impl Drop for SyncTriggerLoop {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
