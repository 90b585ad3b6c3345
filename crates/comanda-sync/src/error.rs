use std::fmt;

use crate::store::ReplayRejection;

#[derive(Debug)]
pub enum ComandaSyncError {
    KvStore(String),
    Serialization(String),
    IO(String),
    Transport(String),     // 网络层错误（连接失败、DNS 等）
    Store {
        status: u16,
        message: String,
    },                     // 托管数据库返回的错误
    Timeout(String),
    QueueFull(String),
    Rejected(ReplayRejection), // 重放前校验失败
    InvalidArgument(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    Other(String),
}

impl fmt::Display for ComandaSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComandaSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            ComandaSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ComandaSyncError::IO(e) => write!(f, "IO error: {}", e),
            ComandaSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            ComandaSyncError::Store { status, message } => {
                write!(f, "Backing store error [{}]: {}", status, message)
            }
            ComandaSyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            ComandaSyncError::QueueFull(e) => write!(f, "Queue is full: {}", e),
            ComandaSyncError::Rejected(e) => write!(f, "Rejected: {}", e),
            ComandaSyncError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            ComandaSyncError::Config(e) => write!(f, "Config error: {}", e),
            ComandaSyncError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            ComandaSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            ComandaSyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for ComandaSyncError {}

impl From<serde_json::Error> for ComandaSyncError {
    fn from(error: serde_json::Error) -> Self {
        ComandaSyncError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for ComandaSyncError {
    fn from(error: std::io::Error) -> Self {
        ComandaSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for ComandaSyncError {
    fn from(error: sled::Error) -> Self {
        ComandaSyncError::KvStore(error.to_string())
    }
}

impl From<reqwest::Error> for ComandaSyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ComandaSyncError::Timeout(error.to_string())
        } else {
            ComandaSyncError::Transport(error.to_string())
        }
    }
}

impl From<ReplayRejection> for ComandaSyncError {
    fn from(rejection: ReplayRejection) -> Self {
        ComandaSyncError::Rejected(rejection)
    }
}

impl ComandaSyncError {
    /// 是否为重放前的校验拒绝（未接触后端存储）
    pub fn is_rejection(&self) -> bool {
        matches!(self, ComandaSyncError::Rejected(_))
    }

    /// 是否为存储层不可用（本地队列读写失败）
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            ComandaSyncError::KvStore(_) | ComandaSyncError::IO(_) | ComandaSyncError::QueueFull(_)
        )
    }

    /// 日志用的错误分类标签
    pub fn category(&self) -> &'static str {
        match self {
            ComandaSyncError::Rejected(_) => "validation",
            ComandaSyncError::Transport(_) | ComandaSyncError::Timeout(_) => "transport",
            ComandaSyncError::Store { .. } => "backing_store",
            ComandaSyncError::KvStore(_) | ComandaSyncError::IO(_) | ComandaSyncError::QueueFull(_) => "storage",
            _ => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, ComandaSyncError>;
