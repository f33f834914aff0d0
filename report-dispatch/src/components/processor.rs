//! 处理器模块
//! Processor module
//!
//! ## 概述 / Overview
//!
//! Processor 从队列中按优先级取出报表任务，交给 [`JobHandler`] 执行，并根据结果确认、重试或标记失败。
//!
//! The Processor claims report jobs from the queue in priority order, hands them to a
//! [`JobHandler`], and acknowledges, retries or fails them depending on the outcome.
//!
//! ## 主要特性 / Key Features
//!
//! - **信号量并发控制**: 只有在有空闲工作者槽位时才会领取任务
//!   - **Semaphore-based concurrency**: a job is claimed only when a worker slot is free
//!
//! - **自动重试**: 可重试错误在 `max_attempts` 以内按退避策略延迟重试
//!   - **Automatic retry**: retriable errors are delayed by the backoff policy while attempts remain
//!
//! - **失败追踪**: 终态结果写回计划的执行历史
//!   - **Failure tracking**: terminal outcomes are written back to the schedule's history
//!
//! - **租约续期**: 任务执行期间定期延长租约，工作者消失后由 Recoverer 接管
//!   - **Lease renewal**: the lease is extended while a job runs; once a worker is gone the Recoverer takes over
//!
//! - **优雅关闭**: 停止领取新任务，在 `shutdown_timeout` 内等待进行中的工作者
//!   - **Graceful shutdown**: stops claiming and waits for in-flight workers up to `shutdown_timeout`

use crate::base::Broker;
use crate::clock::Clock;
use crate::error::Error;
use crate::handler::{as_millis, JobHandler};
use crate::job::{JobMessage, RetryPolicy};
use crate::tracker::FailureTracker;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// 处理器参数
/// Processor parameters
pub struct ProcessorParams {
  pub broker: Arc<dyn Broker>,
  pub tracker: Arc<FailureTracker>,
  pub clock: Arc<dyn Clock>,
  pub retry_policy: RetryPolicy,
  pub concurrency: usize,
  pub job_check_interval: Duration,
  pub shutdown_timeout: Duration,
  pub lease_duration: Duration,
  pub active_workers: Arc<AtomicUsize>,
}

/// 单个工作者执行任务所需的共享状态，也被 Recoverer 用来结算租约过期的任务
/// Shared state a worker needs to run one job; the Recoverer also uses it to settle lease-expired jobs
#[derive(Clone)]
pub(crate) struct WorkerContext {
  broker: Arc<dyn Broker>,
  tracker: Arc<FailureTracker>,
  clock: Arc<dyn Clock>,
  retry_policy: RetryPolicy,
  lease_duration: Duration,
}

/// 处理器 - 负责从队列中取出任务并处理
/// Processor - responsible for dequeuing and processing jobs
pub struct Processor {
  ctx: WorkerContext,
  concurrency: usize,
  job_check_interval: Duration,
  shutdown_timeout: Duration,

  // 信号量用于限制并发工作者数量
  // Semaphore to limit number of concurrent workers
  sema: Arc<Semaphore>,

  running: Arc<AtomicBool>,

  // 退出信号通道
  // Quit signal channel
  quit_tx: Option<mpsc::Sender<()>>,
  quit_rx: Option<mpsc::Receiver<()>>,

  handle: Option<JoinHandle<()>>,

  active_workers: Arc<AtomicUsize>,
}

impl Processor {
  /// 创建新的处理器
  /// Create a new processor
  pub fn new(params: ProcessorParams) -> Self {
    let concurrency = params.concurrency.max(1);
    let (quit_tx, quit_rx) = mpsc::channel(1);

    Self {
      ctx: WorkerContext::new(
        params.broker,
        params.tracker,
        params.clock,
        params.retry_policy,
        params.lease_duration,
      ),
      concurrency,
      job_check_interval: params.job_check_interval,
      shutdown_timeout: params.shutdown_timeout,
      sema: Arc::new(Semaphore::new(concurrency)),
      running: Arc::new(AtomicBool::new(false)),
      quit_tx: Some(quit_tx),
      quit_rx: Some(quit_rx),
      handle: None,
      active_workers: params.active_workers,
    }
  }

  /// 当前正在执行的工作者数量
  /// Number of workers currently executing a job
  pub fn active_workers(&self) -> usize {
    self.active_workers.load(Ordering::Relaxed)
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// 启动处理器
  /// Start the processor
  pub fn start<H>(&mut self, handler: Arc<H>)
  where
    H: JobHandler + ?Sized + 'static,
  {
    let Some(mut quit_rx) = self.quit_rx.take() else {
      tracing::warn!("Processor already started");
      return;
    };
    self.running.store(true, Ordering::SeqCst);

    let ctx = self.ctx.clone();
    let running = Arc::clone(&self.running);
    let sema = Arc::clone(&self.sema);
    let job_check_interval = self.job_check_interval;
    let active_workers = Arc::clone(&self.active_workers);

    let handle = tokio::spawn(async move {
      loop {
        // 检查是否收到退出信号
        // Check if quit signal received
        if quit_rx.try_recv().is_ok() || !running.load(Ordering::SeqCst) {
          tracing::debug!("Processor received quit signal");
          break;
        }

        // 尝试获取信号量令牌
        // Try to acquire semaphore permit
        let permit = match sema.clone().try_acquire_owned() {
          Ok(permit) => permit,
          Err(_) => {
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
          }
        };

        match ctx.broker.dequeue(ctx.lease_deadline()).await {
          Ok(Some(msg)) => {
            active_workers.fetch_add(1, Ordering::Relaxed);

            let ctx = ctx.clone();
            let handler = Arc::clone(&handler);
            let active_workers = Arc::clone(&active_workers);

            tokio::spawn(async move {
              let _permit = permit;
              ctx.run(handler.as_ref(), msg).await;
              active_workers.fetch_sub(1, Ordering::Relaxed);
            });
          }
          Ok(None) => {
            // 没有任务，等待后重试
            // No jobs, wait and retry
            drop(permit);
            tokio::select! {
              _ = quit_rx.recv() => break,
              _ = tokio::time::sleep(job_check_interval) => {}
            }
          }
          Err(e) => {
            tracing::error!("Dequeue error: {}", e);
            drop(permit);
            tokio::time::sleep(Duration::from_secs(1)).await;
          }
        }
      }

      tracing::debug!("Processor loop exited");
    });

    self.handle = Some(handle);
  }

  /// 停止领取新任务（不等待工作者完成）
  /// Stop claiming new jobs (without waiting for workers)
  pub fn stop(&mut self) {
    self.running.store(false, Ordering::SeqCst);
    if let Some(tx) = self.quit_tx.take() {
      let _ = tx.try_send(());
    }
  }

  /// 关闭处理器并在超时内等待所有工作者完成
  /// Shutdown the processor and wait for all workers to finish within the timeout
  pub async fn shutdown(&mut self) {
    self.stop();

    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }

    tracing::info!("Waiting for all workers to finish...");

    // 所有令牌都能重新获取时，说明工作者全部完成
    // Once every permit can be reacquired, all workers have finished
    let permits = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
    let acquired =
      tokio::time::timeout(self.shutdown_timeout, self.sema.acquire_many(permits)).await;
    match acquired {
      Ok(_) => tracing::info!("All workers have finished"),
      Err(_) => tracing::warn!(
        "Shutdown timeout reached with {} workers still active",
        self.active_workers()
      ),
    }
  }
}

impl WorkerContext {
  pub(crate) fn new(
    broker: Arc<dyn Broker>,
    tracker: Arc<FailureTracker>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    lease_duration: Duration,
  ) -> Self {
    Self {
      broker,
      tracker,
      clock,
      retry_policy,
      lease_duration,
    }
  }

  /// 从现在起算的租约到期时间
  /// Lease deadline counted from now
  fn lease_deadline(&self) -> DateTime<Utc> {
    self.clock.now()
      + chrono::Duration::from_std(self.lease_duration)
        .unwrap_or_else(|_| chrono::Duration::seconds(30))
  }

  /// 执行任务，同时每隔租约的三分之一续约一次
  /// Run a job, renewing its lease every third of the lease duration
  async fn run<H>(&self, handler: &H, msg: JobMessage)
  where
    H: JobHandler + ?Sized,
  {
    let id = msg.id.clone();
    let work = self.execute(handler, msg);
    tokio::pin!(work);

    let period = (self.lease_duration / 3).max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
      tokio::select! {
        _ = &mut work => break,
        _ = heartbeat.tick() => match self.broker.extend_lease(&id, self.lease_deadline()).await {
          Ok(true) => {}
          Ok(false) => tracing::warn!("Job {} lost its lease while running", id),
          Err(e) => tracing::warn!("Failed to extend lease of job {}: {}", id, e),
        },
      }
    }
  }

  /// 执行一个任务并记录结果
  /// Run one job and record its outcome
  async fn execute<H>(&self, handler: &H, msg: JobMessage)
  where
    H: JobHandler + ?Sized,
  {
    let started = Instant::now();
    let result = handler.process(&msg).await;
    let duration_ms = as_millis(started.elapsed());

    match result {
      Ok(outcome) => {
        if let Err(e) = self.broker.done(&msg, self.clock.now()).await {
          tracing::error!("Failed to mark job {} as done: {}", msg.id, e);
        }
        tracing::info!(
          job_id = %msg.id,
          schedule_id = %msg.schedule_id,
          recipients = outcome.recipient_count,
          failed = outcome.failed_recipients.len(),
          "Report job completed in {}ms",
          outcome.duration_ms
        );
        if let Err(e) = self.tracker.record_success(&msg, &outcome).await {
          tracing::error!("Failed to record success of job {}: {}", msg.id, e);
        }
      }
      Err(e) => self.handle_failure(&msg, e, duration_ms).await,
    }
  }

  /// 重试或最终失败一个任务，与 Recoverer 共用
  /// Retry or terminally fail a job; shared with the Recoverer
  pub(crate) async fn handle_failure(&self, msg: &JobMessage, err: Error, duration_ms: u64) {
    let error_message = err.to_string();

    if err.is_retriable() && msg.can_retry() {
      let delay = self.retry_policy.calculate_delay(msg.attempt);
      let retry_at = self.clock.now()
        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
      tracing::warn!(
        job_id = %msg.id,
        attempt = msg.attempt + 1,
        max_attempts = msg.max_attempts,
        "Report job failed, retrying in {:?}: {}",
        delay,
        error_message
      );
      if let Err(e) = self.broker.retry(msg, retry_at, &error_message).await {
        tracing::error!("Failed to requeue job {}: {}", msg.id, e);
      }
      return;
    }

    tracing::error!(
      job_id = %msg.id,
      attempt = msg.attempt + 1,
      "Report job failed permanently: {}",
      error_message
    );
    if let Err(e) = self
      .broker
      .fail(msg, &error_message, self.clock.now())
      .await
    {
      tracing::error!("Failed to mark job {} as failed: {}", msg.id, e);
    }
    if let Err(e) = self
      .tracker
      .record_failure(msg, &error_message, duration_ms)
      .await
    {
      tracing::error!("Failed to record failure of job {}: {}", msg.id, e);
    }
  }
}
