use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::ComandaSyncError;
use crate::events::{event_builders, EventManager, SyncEvent};
use crate::network::ConnectivityMonitor;
use crate::notify::SyncNotifier;
use crate::storage::queue::{sort_for_replay, OfflineQueue, QueuedAction};
use crate::store::{BackingStore, ReplayCommand};
use crate::sync::{SkipReason, SyncMetrics, SyncReport, SyncTrigger};

/// 离线动作同步器
///
/// 所有触发来源都进入同一个 [`Synchronizer::run`]，由 `drain_guard` 保证同一时间只有一次同步。
pub struct Synchronizer {
    queue: Arc<OfflineQueue>,
    store: Arc<dyn BackingStore>,
    monitor: Arc<ConnectivityMonitor>,
    events: Arc<EventManager>,
    notifier: SyncNotifier,
    drain_guard: tokio::sync::Mutex<()>,
    entry_timeout: Duration,
    stuck_threshold: u32,
    /// 每条动作的连续失败次数（仅内存，成功或重启后清零）
    failure_streaks: Mutex<HashMap<u64, u32>>,
    metrics: RwLock<SyncMetrics>,
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field("entry_timeout", &self.entry_timeout)
            .field("stuck_threshold", &self.stuck_threshold)
            .field("is_syncing", &self.is_syncing())
            .finish()
    }
}

/// 单条动作的重放结果
enum ReplayOutcome {
    Applied,
    Failed(ComandaSyncError),
}

impl Synchronizer {
    pub fn new(
        queue: Arc<OfflineQueue>,
        store: Arc<dyn BackingStore>,
        monitor: Arc<ConnectivityMonitor>,
        events: Arc<EventManager>,
        notifier: SyncNotifier,
        config: &SyncConfig,
    ) -> Self {
        Self {
            queue,
            store,
            monitor,
            events,
            notifier,
            drain_guard: tokio::sync::Mutex::new(()),
            entry_timeout: config.entry_timeout(),
            stuck_threshold: config.stuck_threshold.max(1),
            failure_streaks: Mutex::new(HashMap::new()),
            metrics: RwLock::new(SyncMetrics::default()),
        }
    }

    /// 是否有同步正在进行
    pub fn is_syncing(&self) -> bool {
        self.drain_guard.try_lock().is_err()
    }

    /// 等待当前同步结束
    pub async fn wait_idle(&self) {
        let _guard = self.drain_guard.lock().await;
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.metrics.read().clone()
    }

    /// 当前连续失败次数
    pub fn failure_streak(&self, id: u64) -> u32 {
        self.failure_streaks.lock().get(&id).copied().unwrap_or(0)
    }

    /// 执行一次同步
    ///
    /// 按 (created_at, id) 顺序逐条重放；成功的动作从队列删除，失败的保留到下次。
    #[instrument(skip(self), fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, trigger: SyncTrigger) -> SyncReport {
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());

        let Ok(guard) = self.drain_guard.try_lock() else {
            debug!("已有同步在进行，跳过 ({})", trigger);
            self.metrics.write().runs_skipped += 1;
            return SyncReport::skipped(run_id, trigger, SkipReason::AlreadySyncing);
        };

        if !self.monitor.is_online() {
            debug!("当前离线，跳过同步 ({})", trigger);
            self.metrics.write().runs_skipped += 1;
            return SyncReport::skipped(run_id, trigger, SkipReason::Offline);
        }

        let mut pending = self.queue.list_pending().await;
        sort_for_replay(&mut pending);
        self.prune_failure_streaks(&pending);

        info!("🔄 开始同步: trigger={}, pending={}", trigger, pending.len());
        self.events
            .emit(event_builders::sync_started(&run_id, trigger, pending.len()))
            .await;

        let mut report = SyncReport {
            run_id: run_id.clone(),
            trigger,
            success_count: 0,
            failed_count: 0,
            skipped: None,
        };
        let mut stuck_events = Vec::new();

        for action in &pending {
            match self.replay(action).await {
                ReplayOutcome::Applied => {
                    if let Err(e) = self.queue.remove(action.id).await {
                        error!("动作已同步但从队列删除失败 {}: {}", action.describe(), e);
                    }
                    self.failure_streaks.lock().remove(&action.id);
                    report.success_count += 1;
                }
                ReplayOutcome::Failed(err) => {
                    warn!(
                        id = action.id,
                        collection = %action.target,
                        kind = %action.kind,
                        category = err.category(),
                        "动作同步失败，保留到下次: {}",
                        err
                    );
                    if let Some(event) = self.record_failure(action, &err) {
                        stuck_events.push(event);
                    }
                    report.failed_count += 1;
                }
            }
        }

        {
            let mut metrics = self.metrics.write();
            metrics.runs_total += 1;
            metrics.replay_success_total += report.success_count as u64;
            metrics.replay_failure_total += report.failed_count as u64;
            metrics.stuck_escalations += stuck_events.len() as u64;
            metrics.last_run_at = Some(chrono::Utc::now().timestamp_millis());
        }

        drop(guard);

        info!(
            "✅ 同步完成: trigger={}, success={}, failed={}",
            trigger, report.success_count, report.failed_count
        );

        let stuck_count = stuck_events.len();
        for event in stuck_events {
            self.events.emit(event).await;
        }
        self.events
            .emit(event_builders::sync_completed(
                &run_id,
                trigger,
                report.success_count,
                report.failed_count,
            ))
            .await;
        self.notifier.notify_report(&report, stuck_count).await;

        report
    }

    /// 重放单条动作：校验、带超时发送、捕获 panic
    async fn replay(&self, action: &QueuedAction) -> ReplayOutcome {
        let command = match ReplayCommand::from_action(action) {
            Ok(command) => command,
            Err(rejection) => {
                self.metrics.write().rejected_total += 1;
                return ReplayOutcome::Failed(rejection.into());
            }
        };

        let dispatch = AssertUnwindSafe(command.dispatch(self.store.as_ref())).catch_unwind();

        match timeout(self.entry_timeout, dispatch).await {
            Ok(Ok(Ok(()))) => ReplayOutcome::Applied,
            Ok(Ok(Err(e))) => ReplayOutcome::Failed(e),
            Ok(Err(panic)) => {
                self.metrics.write().panic_total += 1;
                ReplayOutcome::Failed(ComandaSyncError::Other(format!(
                    "dispatch panicked: {}",
                    panic_message(&*panic)
                )))
            }
            Err(_) => {
                self.metrics.write().timeout_total += 1;
                ReplayOutcome::Failed(ComandaSyncError::Timeout(format!(
                    "{} 超过 {}ms 未完成",
                    action.describe(),
                    self.entry_timeout.as_millis()
                )))
            }
        }
    }

    /// 记录失败；连续失败次数刚好达到阈值时返回卡住事件
    fn record_failure(&self, action: &QueuedAction, err: &ComandaSyncError) -> Option<SyncEvent> {
        let failures = {
            let mut streaks = self.failure_streaks.lock();
            let streak = streaks.entry(action.id).or_insert(0);
            *streak += 1;
            *streak
        };

        if failures != self.stuck_threshold {
            return None;
        }

        error!(
            id = action.id,
            collection = %action.target,
            kind = %action.kind,
            failures,
            "动作连续同步失败，需要人工处理: {}",
            err
        );
        Some(event_builders::action_stuck(
            action.id,
            &action.target,
            action.kind,
            failures,
            &err.to_string(),
        ))
    }

    /// 丢弃已不在队列中的动作的失败计数
    fn prune_failure_streaks(&self, pending: &[QueuedAction]) {
        let live: HashSet<u64> = pending.iter().map(|a| a.id).collect();
        self.failure_streaks.lock().retain(|id, _| live.contains(id));
    }

    /// 手动重置失败计数（例如用户修正数据后）
    pub fn reset_failure_streaks(&self) -> usize {
        let mut streaks = self.failure_streaks.lock();
        let count = streaks.len();
        streaks.clear();
        count
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
