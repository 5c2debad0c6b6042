//! 日志初始化

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

use crate::config::LogConfig;
use crate::error::{DiscoveryError, Result};

/// 安装全局 tracing subscriber
///
/// 优先使用 `RUST_LOG`，否则使用配置中的级别。已经安装过时返回 `Ok(false)`。
pub fn init_tracing(config: &LogConfig) -> Result<bool> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| DiscoveryError::config(format!("invalid log level {}: {}", config.level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().json().with_target(true)))
    } else {
        tracing::subscriber::set_global_default(registry.with(fmt::layer().with_target(true)))
    };

    if installed.is_err() {
        return Ok(false);
    }

    // log crate 的记录桥接到 tracing
    let _ = tracing_log::LogTracer::init();
    Ok(true)
}
