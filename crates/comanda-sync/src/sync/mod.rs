//! 离线动作同步
//!
//! - `synchronizer`: 单次同步（按顺序重放队列）
//! - `trigger`: 监听连接事件，自动触发同步

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod synchronizer;
pub mod trigger;

pub use synchronizer::Synchronizer;
pub use trigger::SyncTriggerLoop;

/// 同步触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// 链路恢复（等待稳定后触发）
    Online,
    /// 应用层确认后端可达
    BackOnlineSignal,
    /// 回到前台
    Visible,
    /// 手动触发
    Manual,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTrigger::Online => "online",
            SyncTrigger::BackOnlineSignal => "back_online_signal",
            SyncTrigger::Visible => "visible",
            SyncTrigger::Manual => "manual",
        }
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 同步被跳过的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// 已有同步在进行
    AlreadySyncing,
    /// 当前离线
    Offline,
}

/// 单次同步结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub trigger: SyncTrigger,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped: Option<SkipReason>,
}

impl SyncReport {
    pub fn skipped(run_id: String, trigger: SyncTrigger, reason: SkipReason) -> Self {
        Self {
            run_id,
            trigger,
            success_count: 0,
            failed_count: 0,
            skipped: Some(reason),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }

    /// 本次是否处理过任何动作
    pub fn attempted(&self) -> usize {
        self.success_count + self.failed_count
    }
}

/// 同步统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub runs_total: u64,
    pub runs_skipped: u64,
    pub replay_success_total: u64,
    pub replay_failure_total: u64,
    pub rejected_total: u64,
    pub timeout_total: u64,
    pub panic_total: u64,
    pub stuck_escalations: u64,
    /// 最近一次完成同步的时间（毫秒）
    pub last_run_at: Option<i64>,
}

impl SyncMetrics {
    pub fn success_rate(&self) -> f64 {
        let attempts = self.replay_success_total + self.replay_failure_total;
        if attempts == 0 {
            0.0
        } else {
            self.replay_success_total as f64 / attempts as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_report_is_zero() {
        let report = SyncReport::skipped("r".to_string(), SyncTrigger::Visible, SkipReason::Offline);
        assert!(report.is_skipped());
        assert_eq!(report.attempted(), 0);
    }

    #[test]
    fn test_metrics_success_rate() {
        let mut metrics = SyncMetrics::default();
        assert_eq!(metrics.success_rate(), 0.0);
        metrics.replay_success_total = 3;
        metrics.replay_failure_total = 1;
        assert!((metrics.success_rate() - 0.75).abs() < f64::EPSILON);
    }
}
