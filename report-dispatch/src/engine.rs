//! 引擎模块
//! Engine module
//!
//! 组装 Detector、Processor、Forwarder、Janitor 和 Recoverer，并提供调度引擎的公共接口
//! Wires the Detector, Processor, Forwarder, Janitor and Recoverer together and exposes the
//! public surface of the dispatch engine

use crate::base::constants::VERSION;
use crate::base::Broker;
use crate::base::QueueStats;
use crate::clock::{Clock, SystemClock};
use crate::collaborators::{
  AnalyticsProvider, EmailSender, OwnerNotifier, ReportRenderer, ScheduleRepository,
};
use crate::components::detector::{Detector, DetectorConfig, DetectorReport};
use crate::components::forwarder::{Forwarder, ForwarderConfig};
use crate::components::janitor::{CleanupReport, Janitor, JanitorConfig};
use crate::components::processor::{Processor, ProcessorParams, WorkerContext};
use crate::components::recoverer::{Recoverer, RecovererConfig};
use crate::components::ComponentLifecycle;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::handler::{JobHandler, ReportJobHandler};
use crate::inspector::{HistoryPage, Inspector, Pagination};
use crate::job::{JobInfo, JobMessage};
use crate::memdb::MemoryBroker;
use crate::schedule::ScheduledReport;
use crate::tracker::FailureTracker;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// 引擎状态
/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
  New,
  Running,
  Closed,
}

/// 报表调度引擎
/// Report dispatch engine
pub struct Engine {
  broker: Arc<dyn Broker>,
  clock: Arc<dyn Clock>,
  config: EngineConfig,
  state: EngineState,
  host: String,
  pid: u32,
  engine_uuid: String,
  handler: Arc<dyn JobHandler>,
  tracker: Arc<FailureTracker>,
  inspector: Inspector,
  detector: Arc<Detector>,
  forwarder: Arc<Forwarder>,
  janitor: Arc<Janitor>,
  recoverer: Arc<Recoverer>,
  active_workers: Arc<AtomicUsize>,
  processor: Option<Processor>,
  components: Vec<(Arc<dyn ComponentLifecycle + Send + Sync>, JoinHandle<()>)>,
}

impl Engine {
  /// 创建引擎构建器
  /// Create an engine builder
  pub fn builder() -> EngineBuilder {
    EngineBuilder::new()
  }

  /// 返回组合引擎 id (hostname:pid:uuid)
  /// Returns the combined engine id (hostname:pid:uuid)
  pub fn engine_id(&self) -> String {
    format!("{}:{}:{}", self.host, self.pid, self.engine_uuid)
  }

  pub fn state(&self) -> EngineState {
    self.state
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// 启动引擎的所有后台组件
  /// Start every background component of the engine
  pub async fn start(&mut self) -> Result<()> {
    match self.state {
      EngineState::New => {}
      EngineState::Running => return Err(Error::EngineRunning),
      EngineState::Closed => return Err(Error::EngineClosed),
    }
    self.broker.ping().await?;
    self.state = EngineState::Running;

    let mut processor = Processor::new(ProcessorParams {
      broker: Arc::clone(&self.broker),
      tracker: Arc::clone(&self.tracker),
      clock: Arc::clone(&self.clock),
      retry_policy: self.config.retry_policy.clone(),
      concurrency: self.config.concurrency,
      job_check_interval: self.config.job_check_interval,
      shutdown_timeout: self.config.shutdown_timeout,
      lease_duration: self.config.lease_duration,
      active_workers: Arc::clone(&self.active_workers),
    });
    processor.start(Arc::clone(&self.handler));
    self.processor = Some(processor);

    let components: [Arc<dyn ComponentLifecycle + Send + Sync>; 4] = [
      self.forwarder.clone(),
      self.janitor.clone(),
      self.recoverer.clone(),
      self.detector.clone(),
    ];
    for component in components {
      let handle = component.clone().start();
      self.components.push((component, handle));
    }

    tracing::info!(
      "Engine {} (v{}) started: queue={}, concurrency={}",
      self.engine_id(),
      VERSION,
      self.broker.queue_name(),
      self.config.concurrency
    );
    Ok(())
  }

  /// 启动引擎并运行直到收到停止信号
  /// Start the engine and run until a stop signal is received
  pub async fn run(&mut self) -> Result<()> {
    self.start().await?;
    let _ = signal::ctrl_c().await;
    tracing::info!("Received shutdown signal");
    self.shutdown().await
  }

  /// 关闭引擎：停止领取新任务，并在超时内等待进行中的任务
  /// Shutdown the engine: stop claiming jobs and wait for in-flight jobs within the timeout
  pub async fn shutdown(&mut self) -> Result<()> {
    if self.state == EngineState::Closed {
      return Ok(());
    }
    self.state = EngineState::Closed;

    // 先停止产生新任务的组件
    // Stop the components that produce work first
    for (component, _) in &self.components {
      component.shutdown();
    }

    if let Some(processor) = self.processor.as_mut() {
      processor.shutdown().await;
    }

    let handles = self.components.drain(..).map(|(_, handle)| handle);
    if tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(handles))
      .await
      .is_err()
    {
      tracing::warn!("Engine {}: components did not stop in time", self.engine_id());
    }

    tracing::info!("Engine {} stopped", self.engine_id());
    Ok(())
  }

  fn ensure_open(&self) -> Result<()> {
    if self.state == EngineState::Closed {
      return Err(Error::EngineClosed);
    }
    Ok(())
  }

  /// 手动触发一次计划，立即入队
  /// Manually trigger a schedule, enqueued immediately
  pub async fn enqueue_now(&self, schedule: &ScheduledReport) -> Result<JobInfo> {
    self.enqueue_manual(schedule, None).await
  }

  /// 手动触发一次计划，延迟 `delay` 后执行
  /// Manually trigger a schedule, runnable after `delay`
  pub async fn enqueue_in(&self, schedule: &ScheduledReport, delay: Duration) -> Result<JobInfo> {
    self.enqueue_manual(schedule, Some(delay)).await
  }

  async fn enqueue_manual(
    &self,
    schedule: &ScheduledReport,
    delay: Option<Duration>,
  ) -> Result<JobInfo> {
    self.ensure_open()?;
    schedule.validate()?;

    let now = self.clock.now();
    let process_at = match delay {
      Some(delay) if !delay.is_zero() => Some(
        now
          + chrono::Duration::from_std(delay)
            .map_err(|e| Error::validation(format!("invalid delay: {e}")))?,
      ),
      _ => None,
    };
    let msg = JobMessage::manual(schedule, self.config.max_attempts, now);
    let info = self.broker.enqueue(&msg, process_at).await?;
    tracing::info!(
      job_id = %info.id,
      priority = info.priority,
      "Manually enqueued report {}",
      schedule.title
    );
    Ok(info)
  }

  /// 取消计划尚未开始的任务，返回取消数量
  /// Cancel a schedule's jobs that have not started, returns how many were removed
  pub async fn cancel_jobs_for_schedule(&self, schedule_id: &str) -> Result<usize> {
    let removed = self.broker.cancel_for_schedule(schedule_id).await?;
    tracing::info!("Cancelled {} jobs of schedule {}", removed, schedule_id);
    Ok(removed)
  }

  pub async fn get_queue_stats(&self) -> Result<QueueStats> {
    self.inspector.get_queue_stats().await
  }

  pub async fn get_recent_jobs(&self, limit: usize) -> Result<Vec<JobInfo>> {
    self.inspector.get_recent_jobs(limit).await
  }

  pub async fn get_job(&self, id: &str) -> Result<JobInfo> {
    self.inspector.get_job(id).await
  }

  /// 暂停队列，进行中的任务不受影响
  /// Pause the queue, in-flight jobs are unaffected
  pub async fn pause_queue(&self) -> Result<()> {
    self.broker.pause().await?;
    tracing::info!("Queue {} paused", self.broker.queue_name());
    Ok(())
  }

  pub async fn resume_queue(&self) -> Result<()> {
    self.broker.unpause().await?;
    tracing::info!("Queue {} resumed", self.broker.queue_name());
    Ok(())
  }

  /// 清理过期的已完成和失败任务
  /// Remove expired completed and failed jobs
  pub async fn clean_queue(&self) -> Result<CleanupReport> {
    self.janitor.cleanup().await
  }

  /// 立即执行一次到期检测
  /// Run a due detection pass now
  pub async fn poll_now(&self) -> Result<DetectorReport> {
    self.ensure_open()?;
    self.detector.poll_once().await
  }

  /// 分页获取计划的执行历史，按时间倒序
  /// Get a page of a schedule's execution history, newest first
  pub async fn execution_history(
    &self,
    schedule_id: &str,
    page: usize,
    limit: usize,
  ) -> Result<HistoryPage> {
    self
      .inspector
      .execution_history(schedule_id, Pagination::new(page, limit))
      .await
  }

  pub fn active_workers(&self) -> usize {
    self
      .processor
      .as_ref()
      .map(Processor::active_workers)
      .unwrap_or(0)
  }
}

/// 引擎构建器，所有协作服务都通过它显式注入
/// Engine builder; every collaborator is injected explicitly through it
#[derive(Default)]
pub struct EngineBuilder {
  config: EngineConfig,
  broker: Option<Arc<dyn Broker>>,
  clock: Option<Arc<dyn Clock>>,
  repository: Option<Arc<dyn ScheduleRepository>>,
  analytics: Option<Arc<dyn AnalyticsProvider>>,
  renderer: Option<Arc<dyn ReportRenderer>>,
  email: Option<Arc<dyn EmailSender>>,
  notifier: Option<Arc<dyn OwnerNotifier>>,
  handler: Option<Arc<dyn JobHandler>>,
}

impl EngineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  /// 设置队列后端，默认使用以 `queue_name` 命名的内存 Broker；
  /// 其队列名必须与配置中的 `queue_name` 一致
  /// Set the queue backend, defaults to a memory broker named after `queue_name`;
  /// its queue name must match the configured `queue_name`
  pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
    self.broker = Some(broker);
    self
  }

  /// 设置时钟，默认使用系统时钟
  /// Set the clock, defaults to the system clock
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = Some(clock);
    self
  }

  pub fn repository(mut self, repository: Arc<dyn ScheduleRepository>) -> Self {
    self.repository = Some(repository);
    self
  }

  pub fn analytics(mut self, analytics: Arc<dyn AnalyticsProvider>) -> Self {
    self.analytics = Some(analytics);
    self
  }

  pub fn renderer(mut self, renderer: Arc<dyn ReportRenderer>) -> Self {
    self.renderer = Some(renderer);
    self
  }

  pub fn email(mut self, email: Arc<dyn EmailSender>) -> Self {
    self.email = Some(email);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn OwnerNotifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  /// 替换默认的报表处理器
  /// Replace the default report handler
  pub fn handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
    self.handler = Some(handler);
    self
  }

  /// 构建引擎
  /// Build the engine
  pub fn build(self) -> Result<Engine> {
    self.config.validate()?;
    let config = self.config;

    let repository = self
      .repository
      .ok_or_else(|| Error::config("a schedule repository is required"))?;
    let notifier = self
      .notifier
      .ok_or_else(|| Error::config("an owner notifier is required"))?;
    let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
    let broker: Arc<dyn Broker> = match self.broker {
      Some(broker) if broker.queue_name() != config.queue_name => {
        return Err(Error::config(format!(
          "broker serves queue {}, but the engine is configured for {}",
          broker.queue_name(),
          config.queue_name
        )));
      }
      Some(broker) => broker,
      None => Arc::new(MemoryBroker::with_queue(&config.queue_name)),
    };

    let handler: Arc<dyn JobHandler> = match self.handler {
      Some(handler) => handler,
      None => {
        let analytics = self
          .analytics
          .ok_or_else(|| Error::config("an analytics provider is required"))?;
        let renderer = self
          .renderer
          .ok_or_else(|| Error::config("a report renderer is required"))?;
        let email = self
          .email
          .ok_or_else(|| Error::config("an email sender is required"))?;
        Arc::new(ReportJobHandler::new(
          analytics,
          renderer,
          email,
          Arc::clone(&clock),
          config.collaborator_timeout,
        ))
      }
    };

    let tracker = Arc::new(FailureTracker::new(
      Arc::clone(&repository),
      notifier,
      Arc::clone(&clock),
    ));
    let recoverer = Arc::new(Recoverer::new(
      Arc::clone(&broker),
      Arc::clone(&clock),
      WorkerContext::new(
        Arc::clone(&broker),
        Arc::clone(&tracker),
        Arc::clone(&clock),
        config.retry_policy.clone(),
        config.lease_duration,
      ),
      RecovererConfig {
        interval: config.recover_interval,
      },
    ));
    let inspector = Inspector::new(
      Arc::clone(&broker),
      Arc::clone(&repository),
      Arc::clone(&clock),
    );
    let detector = Arc::new(Detector::new(
      repository,
      Arc::clone(&broker),
      Arc::clone(&clock),
      DetectorConfig {
        interval: config.poll_interval,
        max_attempts: config.max_attempts,
      },
    ));
    let forwarder = Arc::new(Forwarder::new(
      Arc::clone(&broker),
      Arc::clone(&clock),
      ForwarderConfig {
        interval: config.forward_interval,
      },
    ));
    let janitor = Arc::new(Janitor::new(
      Arc::clone(&broker),
      Arc::clone(&clock),
      JanitorConfig {
        interval: config.janitor_interval,
        completed_max_age: config.completed_max_age,
        failed_max_age: config.failed_max_age,
      },
    ));

    let host = hostname::get()
      .unwrap_or_default()
      .to_string_lossy()
      .to_string();

    Ok(Engine {
      broker,
      clock,
      config,
      state: EngineState::New,
      host,
      pid: std::process::id(),
      engine_uuid: Uuid::new_v4().to_string(),
      handler,
      tracker,
      inspector,
      detector,
      forwarder,
      janitor,
      recoverer,
      active_workers: Arc::new(AtomicUsize::new(0)),
      processor: None,
      components: Vec::new(),
    })
  }
}
