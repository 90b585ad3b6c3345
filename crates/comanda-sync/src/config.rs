//! 同步配置

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ComandaSyncError, Result};
use crate::network::DEFAULT_RECONNECT_NOTICE_MS;
use crate::storage::queue::DEFAULT_FALLBACK_CAPACITY;

/// 托管数据库 REST 接口配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// 例如 https://xyz.supabase.co
    pub base_url: String,
    pub api_key: String,
    /// 单次请求超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    20
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// 离线同步配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    /// 租户（门店）ID，决定离线队列的命名空间
    pub tenant_id: String,
    /// 内存降级队列容量
    pub fallback_capacity: usize,
    /// 链路恢复后等待多久再同步（毫秒）
    pub settle_delay_ms: u64,
    /// “刚恢复连接”提示时长（毫秒）
    pub reconnect_notice_ms: u64,
    /// 单条动作重放超时（毫秒）
    pub entry_timeout_ms: u64,
    /// 连续失败多少次视为卡住
    pub stuck_threshold: u32,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    pub notifications_enabled: bool,
    /// 调试模式（DEBUG 日志）
    pub debug_mode: bool,
    pub store: Option<StoreConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            tenant_id: "default".to_string(),
            fallback_capacity: DEFAULT_FALLBACK_CAPACITY,
            settle_delay_ms: 1000,
            reconnect_notice_ms: DEFAULT_RECONNECT_NOTICE_MS,
            entry_timeout_ms: 30_000,
            stuck_threshold: 5,
            event_buffer_size: 256,
            notifications_enabled: true,
            debug_mode: false,
            store: None,
        }
    }
}

/// 获取默认数据目录 ~/.comanda/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".comanda")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".comanda")
    } else {
        PathBuf::from("./comanda_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 文件加载，缺省字段取默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ComandaSyncError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .map_err(|e| ComandaSyncError::Config(format!("解析配置文件 {} 失败: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(ComandaSyncError::Config("tenant_id 不能为空".to_string()));
        }
        if self.tenant_id.contains(|c: char| c == '/' || c == '\\' || c.is_whitespace()) {
            return Err(ComandaSyncError::Config(format!("tenant_id 含有非法字符: {}", self.tenant_id)));
        }
        if self.fallback_capacity == 0 {
            return Err(ComandaSyncError::Config("fallback_capacity 必须大于 0".to_string()));
        }
        if self.entry_timeout_ms == 0 {
            return Err(ComandaSyncError::Config("entry_timeout_ms 必须大于 0".to_string()));
        }
        if self.stuck_threshold == 0 {
            return Err(ComandaSyncError::Config("stuck_threshold 必须大于 0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(ComandaSyncError::Config("event_buffer_size 必须大于 0".to_string()));
        }
        if let Some(store) = &self.store {
            if !(store.base_url.starts_with("http://") || store.base_url.starts_with("https://")) {
                return Err(ComandaSyncError::Config(format!("无效的 base_url: {}", store.base_url)));
            }
            if store.api_key.is_empty() {
                return Err(ComandaSyncError::Config("api_key 不能为空".to_string()));
            }
            if store.request_timeout_secs == 0 {
                return Err(ComandaSyncError::Config("request_timeout_secs 必须大于 0".to_string()));
            }
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reconnect_notice(&self) -> Duration {
        Duration::from_millis(self.reconnect_notice_ms)
    }

    pub fn entry_timeout(&self) -> Duration {
        Duration::from_millis(self.entry_timeout_ms)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self { config: SyncConfig::default() }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn tenant_id<S: Into<String>>(mut self, tenant_id: S) -> Self {
        self.config.tenant_id = tenant_id.into();
        self
    }

    pub fn fallback_capacity(mut self, capacity: usize) -> Self {
        self.config.fallback_capacity = capacity;
        self
    }

    pub fn settle_delay_ms(mut self, ms: u64) -> Self {
        self.config.settle_delay_ms = ms;
        self
    }

    pub fn reconnect_notice_ms(mut self, ms: u64) -> Self {
        self.config.reconnect_notice_ms = ms;
        self
    }

    pub fn entry_timeout_ms(mut self, ms: u64) -> Self {
        self.config.entry_timeout_ms = ms;
        self
    }

    pub fn stuck_threshold(mut self, threshold: u32) -> Self {
        self.config.stuck_threshold = threshold;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn notifications_enabled(mut self, enabled: bool) -> Self {
        self.config.notifications_enabled = enabled;
        self
    }

    pub fn debug_mode(mut self, debug: bool) -> Self {
        self.config.debug_mode = debug;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = Some(store);
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}
