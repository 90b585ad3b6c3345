//! 页面可见性
//!
//! 页面切回前台时由各 Hook 做相应处理，同步器借此补跑一次离线队列。

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::network::ConnectivityMonitor;
use crate::sync::{Synchronizer, SyncTrigger};

/// 页面可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Visible => write!(f, "visible"),
            Visibility::Hidden => write!(f, "hidden"),
        }
    }
}

/// 可见性变化回调
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_visibility(&self, visibility: Visibility) -> Result<()>;
}

/// 可见性 Hook 注册表
#[derive(Default)]
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn register(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("可见性 Hook 已注册 (共 {} 个)", self.hooks.len());
    }

    /// 依注册顺序分发；单个 Hook 出错不影响后续 Hook，返回遇到的第一个错误
    pub async fn dispatch(&self, visibility: Visibility) -> Result<()> {
        debug!("页面可见性变化: {}", visibility);

        let mut outcome = Ok(());
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_visibility(visibility).await {
                warn!("Hook #{} 处理 {} 失败: {}", index, visibility, e);
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

/// 页面可见且在线时补跑一次同步
pub struct SyncLifecycleHook {
    synchronizer: Arc<Synchronizer>,
    monitor: Arc<ConnectivityMonitor>,
}

impl SyncLifecycleHook {
    pub fn new(synchronizer: Arc<Synchronizer>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { synchronizer, monitor }
    }
}

#[async_trait]
impl LifecycleHook for SyncLifecycleHook {
    async fn on_visibility(&self, visibility: Visibility) -> Result<()> {
        match visibility {
            Visibility::Hidden => {}
            Visibility::Visible if !self.monitor.is_online() => debug!("页面可见但当前离线，跳过同步"),
            Visibility::Visible => {
                self.synchronizer.run(SyncTrigger::Visible).await;
            }
        }
        Ok(())
    }
}
