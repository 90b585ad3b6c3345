//! 日志初始化

use tracing::Level;

/// 安装全局 fmt 日志订阅者
///
/// 调试模式输出 DEBUG，否则 INFO。已有全局订阅者时不做任何事，返回 false。
pub fn init_tracing(debug_mode: bool) -> bool {
    let level = if debug_mode { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(debug_mode)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(true);
        assert!(!init_tracing(false));
    }
}
