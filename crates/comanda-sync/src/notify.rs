//! 用户通知
//!
//! 同步结束后向用户展示一条汇总通知，尽力而为：
//! 未授权时不展示，展示失败只记录 debug 日志。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::sync::SyncReport;

/// 通知权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// 用户尚未选择
    Default,
}

/// 平台通知接口
#[async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    fn permission(&self) -> NotificationPermission;

    async fn show(&self, title: &str, body: &str) -> Result<()>;
}

/// 同步结果通知
#[derive(Debug, Clone)]
pub struct SyncNotifier {
    sink: Option<Arc<dyn NotificationSink>>,
    enabled: bool,
}

impl SyncNotifier {
    pub fn new(sink: Option<Arc<dyn NotificationSink>>, enabled: bool) -> Self {
        Self { sink, enabled }
    }

    pub fn disabled() -> Self {
        Self { sink: None, enabled: false }
    }

    /// 汇总文案；没有需要告知的内容时返回 None
    pub fn summary(report: &SyncReport, stuck: usize) -> Option<(String, String)> {
        if report.success_count == 0 && report.failed_count == 0 {
            return None;
        }

        let title = if report.failed_count == 0 {
            "Offline changes synced".to_string()
        } else {
            "Sync finished with errors".to_string()
        };

        let mut body = format!("{} synced", report.success_count);
        if report.failed_count > 0 {
            body.push_str(&format!(", {} failed and will be retried", report.failed_count));
        }
        if stuck > 0 {
            body.push_str(&format!(". {} change(s) keep failing and need attention", stuck));
        }
        body.push('.');

        Some((title, body))
    }

    /// 展示同步结果通知
    pub async fn notify_report(&self, report: &SyncReport, stuck: usize) {
        if !self.enabled {
            return;
        }
        let Some(sink) = &self.sink else {
            return;
        };
        if sink.permission() != NotificationPermission::Granted {
            return;
        }
        let Some((title, body)) = Self::summary(report, stuck) else {
            return;
        };

        if let Err(e) = sink.show(&title, &body).await {
            debug!("展示同步通知失败: {}", e);
        }
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use crate::error::ComandaSyncError;
    use parking_lot::Mutex;

    /// 测试用：记录通知内容
    #[derive(Debug)]
    pub struct RecordingSink {
        permission: Mutex<NotificationPermission>,
        shown: Mutex<Vec<(String, String)>>,
        fail: Mutex<bool>,
    }

    impl RecordingSink {
        pub fn new(permission: NotificationPermission) -> Arc<Self> {
            Arc::new(Self {
                permission: Mutex::new(permission),
                shown: Mutex::new(Vec::new()),
                fail: Mutex::new(false),
            })
        }

        pub fn shown(&self) -> Vec<(String, String)> {
            self.shown.lock().clone()
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock() = fail;
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn permission(&self) -> NotificationPermission {
            *self.permission.lock()
        }

        async fn show(&self, title: &str, body: &str) -> Result<()> {
            if *self.fail.lock() {
                return Err(ComandaSyncError::Other("notification service unavailable".to_string()));
            }
            self.shown.lock().push((title.to_string(), body.to_string()));
            Ok(())
        }
    }
}
