//! Comanda Sync - 离线动作队列与重连同步
//!
//! 门店断网时，写操作先进入本地持久化队列；恢复连接后按入队顺序重放到托管数据库：
//! - 📦 离线队列：sled 持久化，失败时降级到有界内存队列
//! - 📡 连接监控：上下线边沿事件，“刚恢复连接”提示窗口
//! - 🔄 同步器：单飞执行，逐条超时保护，失败保留重试，连续失败告警
//! - ⚙️ 事件系统：同步进度与结果广播
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use comanda_sync::{ActionKind, OfflineSync, StoreConfig, SubmitOutcome, SyncConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/var/lib/comanda")
//!         .tenant_id("loja_centro")
//!         .store(StoreConfig::new("https://db.example.com", "anon-key"))
//!         .build();
//!
//!     let sync = OfflineSync::initialize(config, None, None, None).await?;
//!
//!     let payload = json!({"amount": 42}).as_object().cloned().unwrap_or_default();
//!     match sync.submit(ActionKind::Insert, "sales", payload).await? {
//!         SubmitOutcome::Applied => println!("已写入"),
//!         SubmitOutcome::Queued(id) => println!("离线排队: #{}", id),
//!     }
//!
//!     let report = sync.sync_now().await?;
//!     println!("同步 {} 条, 失败 {} 条", report.success_count, report.failed_count);
//!
//!     sync.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod http_client;
pub mod lifecycle;
pub mod logging;
pub mod network;
pub mod notify;
pub mod sdk;
pub mod storage;
pub mod store;
pub mod sync;
pub mod version;

pub use config::{StoreConfig, SyncConfig, SyncConfigBuilder};
pub use error::{ComandaSyncError, Result};
pub use events::{EventManager, EventStats, SyncEvent};
pub use http_client::RestBackingStore;
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook, Visibility};
pub use network::{
    ConnectivityEvent, ConnectivityMonitor, ConnectivityState, NetworkStatus, NetworkStatusEvent,
    NetworkStatusListener,
};
pub use notify::{NotificationPermission, NotificationSink, SyncNotifier};
pub use sdk::{OfflineSync, SubmitOutcome};
pub use storage::{ActionKind, OfflineQueue, QueueStats, QueuedAction};
pub use store::{BackingStore, Collection, ReplayCommand, ReplayRejection};
pub use sync::{SkipReason, SyncMetrics, SyncReport, SyncTrigger, Synchronizer};
pub use version::{QUEUE_FORMAT_VERSION, SDK_VERSION};
