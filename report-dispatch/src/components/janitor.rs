//! Janitor 模块
//! Janitor module
//!
//! 定期清理超过保留期限的已完成任务（默认 24 小时）和失败任务（默认 7 天）
//! Periodically removes completed jobs (24h by default) and failed jobs (7 days by default) past their retention age

use crate::base::constants::{DEFAULT_COMPLETED_MAX_AGE, DEFAULT_FAILED_MAX_AGE, DEFAULT_JANITOR_INTERVAL};
use crate::base::keys::JobState;
use crate::base::Broker;
use crate::clock::Clock;
use crate::components::ComponentLifecycle;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Janitor 配置
/// Janitor configuration
#[derive(Debug, Clone)]
pub struct JanitorConfig {
  /// 清理间隔
  /// Cleanup interval
  pub interval: Duration,
  pub completed_max_age: Duration,
  pub failed_max_age: Duration,
}

impl Default for JanitorConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_JANITOR_INTERVAL,
      completed_max_age: DEFAULT_COMPLETED_MAX_AGE,
      failed_max_age: DEFAULT_FAILED_MAX_AGE,
    }
  }
}

/// 一次清理的结果
/// Result of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
  pub completed: usize,
  pub failed: usize,
}

/// Janitor - 负责定期清理过期任务
/// Janitor - responsible for periodically cleaning up expired jobs
pub struct Janitor {
  broker: Arc<dyn Broker>,
  clock: Arc<dyn Clock>,
  config: JanitorConfig,
  done: CancellationToken,
}

impl Janitor {
  /// 创建新的 Janitor
  /// Create a new Janitor
  pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, config: JanitorConfig) -> Self {
    Self {
      broker,
      clock,
      config,
      done: CancellationToken::new(),
    }
  }

  /// 启动 Janitor
  /// Start the Janitor
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = self.done.cancelled() => {
            tracing::debug!("Janitor: shutting down");
            break;
          }
          _ = interval.tick() => {}
        }

        if let Err(e) = self.cleanup().await {
          tracing::error!("Janitor cleanup error: {}", e);
        }
      }
    })
  }

  /// 执行清理任务
  /// Execute cleanup
  pub async fn cleanup(&self) -> Result<CleanupReport> {
    let now = self.clock.now();
    let completed_cutoff = now - to_chrono(self.config.completed_max_age)?;
    let failed_cutoff = now - to_chrono(self.config.failed_max_age)?;

    let completed = self
      .broker
      .delete_expired(JobState::Completed, completed_cutoff)
      .await?;
    let failed = self
      .broker
      .delete_expired(JobState::Failed, failed_cutoff)
      .await?;
    if completed + failed > 0 {
      tracing::info!(
        "Janitor: removed {} completed and {} failed jobs",
        completed,
        failed
      );
    }
    Ok(CleanupReport { completed, failed })
  }

  /// 停止 Janitor
  /// Stop the Janitor
  pub fn shutdown(&self) {
    self.done.cancel();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
  chrono::Duration::from_std(duration).map_err(|e| Error::config(format!("invalid retention age: {e}")))
}

impl ComponentLifecycle for Janitor {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Janitor::start(self)
  }

  fn shutdown(&self) {
    Janitor::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Janitor::is_done(self)
  }
}
