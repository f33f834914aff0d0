//! Forwarder 模块
//! Forwarder module
//!
//! 定期检查延迟任务，将退避结束或延迟到期的任务转回等待队列
//! Periodically checks delayed jobs and moves those whose backoff or delay has elapsed back to waiting

use crate::base::constants::DEFAULT_FORWARD_INTERVAL;
use crate::base::Broker;
use crate::clock::Clock;
use crate::components::ComponentLifecycle;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Forwarder 配置
/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
  /// 检查间隔
  /// Check interval
  pub interval: Duration,
}

impl Default for ForwarderConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_FORWARD_INTERVAL,
    }
  }
}

/// Forwarder - 负责转发到期的延迟任务
/// Forwarder - responsible for forwarding due delayed jobs
pub struct Forwarder {
  broker: Arc<dyn Broker>,
  clock: Arc<dyn Clock>,
  config: ForwarderConfig,
  done: CancellationToken,
}

impl Forwarder {
  /// 创建新的 Forwarder
  /// Create a new Forwarder
  pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, config: ForwarderConfig) -> Self {
    Self {
      broker,
      clock,
      config,
      done: CancellationToken::new(),
    }
  }

  /// 启动 Forwarder
  /// Start the Forwarder
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = self.done.cancelled() => {
            tracing::debug!("Forwarder: shutting down");
            break;
          }
          _ = interval.tick() => {}
        }

        if let Err(e) = self.forward().await {
          tracing::error!("Forwarder error: {}", e);
        }
      }
    })
  }

  /// 执行一次转发，返回转发数量
  /// Run one forwarding pass, returns how many jobs were forwarded
  pub async fn forward(&self) -> Result<usize> {
    let forwarded = self.broker.forward_if_ready(self.clock.now()).await?;
    if forwarded > 0 {
      tracing::debug!("Forwarder: moved {} delayed jobs to waiting", forwarded);
    }
    Ok(forwarded)
  }

  /// 停止 Forwarder
  /// Stop the Forwarder
  pub fn shutdown(&self) {
    self.done.cancel();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }
}

impl ComponentLifecycle for Forwarder {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Forwarder::start(self)
  }

  fn shutdown(&self) {
    Forwarder::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Forwarder::is_done(self)
  }
}
