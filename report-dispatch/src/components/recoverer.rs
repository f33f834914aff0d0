//! Recoverer 模块
//! Recoverer module
//!
//! 定期找出租约已过期的 active 任务（工作者崩溃、关闭超时或确认失败），
//! 并按正常的重试/失败流程结算它们
//!
//! Periodically finds active jobs whose lease expired (worker crash, shutdown timeout or a failed
//! acknowledgement) and settles them through the normal retry/fail path

use crate::base::constants::{DEFAULT_RECOVER_INTERVAL, LEASE_EXPIRED_ERROR};
use crate::base::Broker;
use crate::clock::Clock;
use crate::components::processor::WorkerContext;
use crate::components::ComponentLifecycle;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Recoverer 配置
/// Recoverer configuration
#[derive(Debug, Clone)]
pub struct RecovererConfig {
  /// 恢复间隔
  /// Recovery interval
  pub interval: Duration,
}

impl Default for RecovererConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_RECOVER_INTERVAL,
    }
  }
}

/// Recoverer - 负责恢复孤儿任务
/// Recoverer - responsible for recovering orphaned jobs
pub struct Recoverer {
  broker: Arc<dyn Broker>,
  clock: Arc<dyn Clock>,
  settler: WorkerContext,
  config: RecovererConfig,
  done: CancellationToken,
}

impl Recoverer {
  pub(crate) fn new(
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    settler: WorkerContext,
    config: RecovererConfig,
  ) -> Self {
    Self {
      broker,
      clock,
      settler,
      config,
      done: CancellationToken::new(),
    }
  }

  /// 启动 Recoverer
  /// Start the Recoverer
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = self.done.cancelled() => {
            tracing::debug!("Recoverer: shutting down");
            break;
          }
          _ = interval.tick() => {}
        }

        if let Err(e) = self.recover().await {
          tracing::error!("Recoverer error: {}", e);
        }
      }
    })
  }

  /// 结算所有租约过期的任务，返回处理数量
  /// Settle every lease-expired job, returns how many were handled
  pub async fn recover(&self) -> Result<usize> {
    let msgs = self.broker.list_lease_expired(self.clock.now()).await?;
    for msg in &msgs {
      tracing::warn!(
        job_id = %msg.id,
        schedule_id = %msg.schedule_id,
        "Recoverer: lease of job expired, its worker is gone"
      );
      self
        .settler
        .handle_failure(msg, Error::transient(LEASE_EXPIRED_ERROR), 0)
        .await;
    }
    Ok(msgs.len())
  }

  /// 停止 Recoverer
  /// Stop the Recoverer
  pub fn shutdown(&self) {
    self.done.cancel();
  }

  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }
}

impl ComponentLifecycle for Recoverer {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Recoverer::start(self)
  }

  fn shutdown(&self) {
    Recoverer::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Recoverer::is_done(self)
  }
}
