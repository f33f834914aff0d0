//! 日志模块
//! Logging module

use crate::error::{Error, Result};
use tracing_subscriber::EnvFilter;

/// 安装全局 `tracing` 订阅者
/// Install the global `tracing` subscriber
///
/// `RUST_LOG` 优先于 `default_directive`；已安装订阅者时返回错误而不是 panic
/// `RUST_LOG` takes precedence over `default_directive`; returns an error instead of
/// panicking when a subscriber is already installed
pub fn init_tracing(default_directive: &str) -> Result<()> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(default_directive))
    .map_err(|e| Error::config(format!("invalid log directive: {e}")))?;

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .try_init()
    .map_err(|e| Error::other(format!("failed to install tracing subscriber: {e}")))
}
