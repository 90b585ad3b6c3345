//! 本地存储模块
//!
//! - `kv`: 基于 sled 的键值存储（离线队列主存储）
//! - `queue`: 离线动作队列（持久化 + 内存降级）

pub mod kv;
pub mod queue;

pub use kv::KvStore;
pub use queue::{
    ActionKind, ActionQueueTrait, MemoryActionQueue, OfflineQueue, PersistentActionQueue,
    QueueStats, QueuedAction,
};

