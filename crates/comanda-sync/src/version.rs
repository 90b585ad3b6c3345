//! 版本与运行时元信息
//!
//! - **Crate Version** → Cargo.toml（唯一权威源）
//! - **Queue Format Version** → 本模块，离线队列落盘格式变更时递增

/// crate semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// build time（由 vergen 在 build.rs 中生成，生成失败时为 "unknown"）
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(value) => value,
    None => "unknown",
};

/// 离线队列条目的落盘格式版本
///
/// 写入 sled 的 meta 键，打开队列时比对；磁盘上的版本更新时拒绝打开，降级为内存队列。
pub const QUEUE_FORMAT_VERSION: u32 = 1;

/// 生成版本摘要（用于启动日志）
pub fn version_summary() -> String {
    format!(
        "comanda-sync {} (queue format v{}, built {})",
        SDK_VERSION, QUEUE_FORMAT_VERSION, BUILD_TIME
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_summary_contains_crate_version() {
        let summary = version_summary();
        assert!(summary.contains(SDK_VERSION));
        assert!(summary.contains("queue format v1"));
    }
}
