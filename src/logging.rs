//! 日志初始化
//!
//! 默认不安装任何订阅器，本 crate 的日志交给宿主的订阅器处理。
//! 宿主可以把 `filter_directive` 加入自己的 `EnvFilter` 来调整本 crate 的级别。

use tracing_subscriber::EnvFilter;

use crate::model::config::{Config, LogLevel};

/// 本 crate 的 tracing target
pub const LOG_TARGET: &str = "trainloop_llm_logging";

/// 构造只作用于本 crate 的过滤器
pub fn filter_directive(level: LogLevel) -> String {
    format!("{}={}", LOG_TARGET, level.as_filter())
}

/// 按解析后的配置安装订阅器
///
/// 只有显式设置了 `TRAINLOOP_LOG_LEVEL` 才会安装
pub fn init_from_config(config: &Config) -> bool {
    if !config.log_level_from_env() {
        return false;
    }
    init(config.log_level)
}

/// 安装 fmt 订阅器
///
/// 进程中已有全局订阅器时保持不变，返回 false
pub fn init(level: LogLevel) -> bool {
    if tracing::dispatcher::has_been_set() {
        return false;
    }
    let filter = EnvFilter::new(filter_directive(level));

    let installed = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .compact()
        .with_env_filter(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(level = level.as_filter(), "日志已初始化");
    }
    installed
}
