//! Detector 模块
//! Detector module
//!
//! 定期查找到期的计划报表，推进其下次运行时间并入队一个任务
//! Periodically finds due scheduled reports, advances their next run and enqueues one job each
//!
//! 下次运行时间通过比较并交换推进，所以多个 Detector 同时运行时每次触发只会入队一次
//! The next run is advanced with a compare-and-swap, so concurrent detectors enqueue each
//! occurrence once

use crate::base::constants::{DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL};
use crate::base::Broker;
use crate::clock::Clock;
use crate::collaborators::ScheduleRepository;
use crate::components::ComponentLifecycle;
use crate::error::{Error, Result};
use crate::job::JobMessage;
use crate::schedule::{calculate_next_run, ScheduledReport};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Detector 配置
/// Detector configuration
#[derive(Debug, Clone)]
pub struct DetectorConfig {
  /// 轮询间隔
  /// Poll interval
  pub interval: Duration,
  /// 入队任务的最大执行次数
  /// Attempt ceiling of enqueued jobs
  pub max_attempts: u32,
}

impl Default for DetectorConfig {
  fn default() -> Self {
    Self {
      interval: DEFAULT_POLL_INTERVAL,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }
}

/// 一次轮询的结果
/// Result of one poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorReport {
  /// 发现的到期计划数
  /// Due schedules found
  pub due: usize,
  pub enqueued: usize,
  /// 已被其他 Detector 领取或任务已存在
  /// Already claimed elsewhere, or the job already existed
  pub skipped: usize,
  pub failed: usize,
}

enum Claim {
  Enqueued,
  Skipped,
}

/// Detector - 负责把到期的计划转换成任务
/// Detector - turns due schedules into jobs
pub struct Detector {
  repository: Arc<dyn ScheduleRepository>,
  broker: Arc<dyn Broker>,
  clock: Arc<dyn Clock>,
  config: DetectorConfig,
  // 保证同一时间只有一次轮询
  // Ensures only one poll runs at a time
  tick: Mutex<()>,
  done: CancellationToken,
}

impl Detector {
  /// 创建新的 Detector
  /// Create a new Detector
  pub fn new(
    repository: Arc<dyn ScheduleRepository>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: DetectorConfig,
  ) -> Self {
    Self {
      repository,
      broker,
      clock,
      config,
      tick: Mutex::new(()),
      done: CancellationToken::new(),
    }
  }

  /// 启动 Detector
  /// Start the Detector
  pub fn start(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(self.config.interval);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
      loop {
        tokio::select! {
          _ = self.done.cancelled() => {
            tracing::debug!("Detector: shutting down");
            break;
          }
          _ = interval.tick() => {}
        }

        if let Err(e) = self.poll_once().await {
          tracing::error!("Detector error: {}", e);
        }
      }
    })
  }

  /// 执行一次轮询
  /// Run one poll
  ///
  /// 如果另一次轮询正在进行，立即返回空结果
  /// Returns an empty report immediately if another poll is in progress
  pub async fn poll_once(&self) -> Result<DetectorReport> {
    let Ok(_guard) = self.tick.try_lock() else {
      tracing::debug!("Detector: previous poll still running, skipping");
      return Ok(DetectorReport::default());
    };

    let now = self.clock.now();
    let due = self.repository.find_due(now).await?;
    let mut report = DetectorReport {
      due: due.len(),
      ..Default::default()
    };
    if due.is_empty() {
      tracing::debug!("Detector: no schedules due");
      return Ok(report);
    }

    for schedule in &due {
      match self.claim(schedule, now).await {
        Ok(Claim::Enqueued) => report.enqueued += 1,
        Ok(Claim::Skipped) => report.skipped += 1,
        Err(e) => {
          tracing::error!("Detector: failed to enqueue schedule {}: {}", schedule.id, e);
          report.failed += 1;
        }
      }
    }

    tracing::info!(
      "Detector: {} due, {} enqueued, {} skipped, {} failed",
      report.due,
      report.enqueued,
      report.skipped,
      report.failed
    );
    Ok(report)
  }

  /// 领取一次到期触发并入队
  /// Claim one due occurrence and enqueue it
  async fn claim(&self, schedule: &ScheduledReport, now: DateTime<Utc>) -> Result<Claim> {
    let observed = schedule.next_run;
    let next = calculate_next_run(schedule.frequency, now);

    if !self
      .repository
      .advance_next_run(&schedule.id, observed, next)
      .await?
    {
      tracing::debug!("Detector: schedule {} already claimed", schedule.id);
      return Ok(Claim::Skipped);
    }

    let msg = JobMessage::scheduled(schedule, observed, self.config.max_attempts, now);
    match self.broker.enqueue(&msg, None).await {
      Ok(_) => {
        tracing::info!(
          job_id = %msg.id,
          priority = msg.priority,
          "Enqueued scheduled report {}, next run at {}",
          schedule.title,
          next
        );
        Ok(Claim::Enqueued)
      }
      Err(Error::JobIdConflict) => {
        tracing::debug!("Detector: job {} already enqueued", msg.id);
        Ok(Claim::Skipped)
      }
      Err(e) => {
        // 还原下次运行时间，下一次轮询会重新领取
        // Restore the next run so the following poll claims it again
        if e.is_retriable() {
          match self
            .repository
            .advance_next_run(&schedule.id, next, observed)
            .await
          {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
              "Detector: next run of schedule {} changed before it could be restored",
              schedule.id
            ),
            Err(revert) => tracing::error!(
              "Detector: failed to restore next run of schedule {}: {}",
              schedule.id,
              revert
            ),
          }
        }
        Err(e)
      }
    }
  }

  /// 停止 Detector
  /// Stop the Detector
  pub fn shutdown(&self) {
    self.done.cancel();
  }

  /// 检查是否已完成
  /// Check if done
  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }
}

impl ComponentLifecycle for Detector {
  fn start(self: Arc<Self>) -> JoinHandle<()> {
    Detector::start(self)
  }

  fn shutdown(&self) {
    Detector::shutdown(self)
  }

  fn is_done(&self) -> bool {
    Detector::is_done(self)
  }
}
