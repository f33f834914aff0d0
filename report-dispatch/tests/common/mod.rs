use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use report_dispatch::clock::ManualClock;
use report_dispatch::collaborators::{
  AnalyticsProvider, AnalyticsQuery, CollaboratorError, EmailMessage, EmailSender, FailureNotice,
  OwnerNotifier, RenderRequest, RenderedReport, ReportData, ReportRenderer,
};
use report_dispatch::config::EngineConfig;
use report_dispatch::engine::Engine;
use report_dispatch::job::RetryPolicy;
use report_dispatch::memdb::{MemoryBroker, MemoryScheduleRepository};
use report_dispatch::schedule::{Frequency, Owner, ReportType, ScheduledReport};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn start_time() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()
}

pub fn schedule(
  id: &str,
  report_type: ReportType,
  frequency: Frequency,
  next_run: DateTime<Utc>,
) -> ScheduledReport {
  ScheduledReport::new(
    id,
    "tenant-1",
    report_type,
    format!("Report {id}"),
    vec!["a@example.com".into()],
    frequency,
    next_run,
    Owner {
      user_id: "owner-1".into(),
      email: "owner@example.com".into(),
      name: Some("Owner".into()),
    },
  )
}

/// 轮询条件直到成立，最多等待 5 秒
/// Poll a condition until it holds, waiting at most 5 seconds
pub async fn wait_until<F, Fut>(mut cond: F) -> bool
where
  F: FnMut() -> Fut,
  Fut: Future<Output = bool>,
{
  for _ in 0..500 {
    if cond().await {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  false
}

/// 分析服务：前 `failures` 次调用返回不可用，可选地在门控上阻塞
/// Analytics fake: the first `failures` calls are unavailable, optionally blocking on a gate
#[derive(Default)]
pub struct RecordingAnalytics {
  failures: AtomicU32,
  gate: Option<Arc<Semaphore>>,
  pub queries: Mutex<Vec<AnalyticsQuery>>,
}

impl RecordingAnalytics {
  pub fn failing(failures: u32) -> Self {
    Self {
      failures: AtomicU32::new(failures),
      ..Default::default()
    }
  }

  pub fn gated(gate: Arc<Semaphore>) -> Self {
    Self {
      gate: Some(gate),
      ..Default::default()
    }
  }

  pub fn calls(&self) -> usize {
    self.queries.lock().unwrap().len()
  }
}

#[async_trait]
impl AnalyticsProvider for RecordingAnalytics {
  async fn generate(
    &self,
    query: AnalyticsQuery,
  ) -> std::result::Result<ReportData, CollaboratorError> {
    let report_type = query.report_type;
    self.queries.lock().unwrap().push(query);
    if let Some(gate) = &self.gate {
      gate
        .acquire()
        .await
        .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?
        .forget();
    }
    let remaining = self.failures.load(Ordering::SeqCst);
    if remaining > 0 {
      self.failures.store(remaining - 1, Ordering::SeqCst);
      return Err(CollaboratorError::Unavailable("analytics database down".into()));
    }
    Ok(serde_json::json!({ "reportType": report_type.as_str(), "total": 42 }))
  }
}

#[derive(Default)]
pub struct RecordingRenderer {
  pub requests: Mutex<Vec<RenderRequest>>,
}

impl RecordingRenderer {
  pub fn rendered_types(&self) -> Vec<ReportType> {
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .map(|r| r.report_type)
      .collect()
  }
}

#[async_trait]
impl ReportRenderer for RecordingRenderer {
  async fn render(
    &self,
    request: RenderRequest,
  ) -> std::result::Result<RenderedReport, CollaboratorError> {
    let file_name = request.context.file_name.clone();
    let mut requests = self.requests.lock().unwrap();
    requests.push(request);
    Ok(RenderedReport {
      report_id: format!("report-{}", requests.len()),
      file_path: format!("/tmp/reports/{file_name}"),
      file_name,
    })
  }
}

/// 对指定收件人投递失败的邮件服务
/// Email fake that fails delivery to the given recipients
#[derive(Default)]
pub struct RecordingEmail {
  fail_for: Vec<String>,
  pub sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingEmail {
  pub fn failing_for(recipients: &[&str]) -> Self {
    Self {
      fail_for: recipients.iter().map(|r| r.to_string()).collect(),
      ..Default::default()
    }
  }
}

#[async_trait]
impl EmailSender for RecordingEmail {
  async fn send(&self, message: EmailMessage) -> std::result::Result<(), CollaboratorError> {
    if self.fail_for.contains(&message.to) {
      return Err(CollaboratorError::Delivery(format!("{} rejected", message.to)));
    }
    self.sent.lock().unwrap().push(message);
    Ok(())
  }
}

#[derive(Default)]
pub struct RecordingNotifier {
  pub notices: Mutex<Vec<FailureNotice>>,
}

#[async_trait]
impl OwnerNotifier for RecordingNotifier {
  async fn notify_owner(
    &self,
    _schedule: &ScheduledReport,
    notice: &FailureNotice,
  ) -> std::result::Result<(), CollaboratorError> {
    self.notices.lock().unwrap().push(notice.clone());
    Ok(())
  }
}

/// 测试配置：快速轮询任务，手动触发检测
/// Test configuration: fast job polling, detection triggered by hand
pub fn fast_config() -> EngineConfig {
  EngineConfig::new()
    .concurrency(1)
    .max_attempts(3)
    .poll_interval(Duration::from_secs(3600))
    .job_check_interval(Duration::from_millis(10))
    .forward_interval(Duration::from_millis(10))
    .janitor_interval(Duration::from_secs(3600))
    .recover_interval(Duration::from_secs(3600))
    .shutdown_timeout(Duration::from_secs(2))
}

/// 一套内存中的引擎及其协作服务
/// An in-memory engine together with its collaborators
pub struct Harness {
  pub engine: Engine,
  pub clock: Arc<ManualClock>,
  pub broker: Arc<MemoryBroker>,
  pub repository: Arc<MemoryScheduleRepository>,
  pub analytics: Arc<RecordingAnalytics>,
  pub renderer: Arc<RecordingRenderer>,
  pub email: Arc<RecordingEmail>,
  pub notifier: Arc<RecordingNotifier>,
}

pub struct HarnessBuilder {
  config: EngineConfig,
  analytics: RecordingAnalytics,
  email: RecordingEmail,
}

impl HarnessBuilder {
  pub fn new() -> Self {
    Self {
      config: fast_config(),
      analytics: RecordingAnalytics::default(),
      email: RecordingEmail::default(),
    }
  }

  pub fn config(mut self, f: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
    self.config = f(self.config);
    self
  }

  pub fn immediate_retries(self) -> Self {
    self.config(|c| c.retry_policy(RetryPolicy::Fixed(Duration::ZERO)))
  }

  pub fn analytics(mut self, analytics: RecordingAnalytics) -> Self {
    self.analytics = analytics;
    self
  }

  pub fn email(mut self, email: RecordingEmail) -> Self {
    self.email = email;
    self
  }

  pub fn build(self) -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let broker = Arc::new(MemoryBroker::new());
    let repository = Arc::new(MemoryScheduleRepository::new());
    let analytics = Arc::new(self.analytics);
    let renderer = Arc::new(RecordingRenderer::default());
    let email = Arc::new(self.email);
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Engine::builder()
      .config(self.config)
      .clock(clock.clone())
      .broker(broker.clone())
      .repository(repository.clone())
      .analytics(analytics.clone())
      .renderer(renderer.clone())
      .email(email.clone())
      .notifier(notifier.clone())
      .build()
      .expect("engine builds");

    Harness {
      engine,
      clock,
      broker,
      repository,
      analytics,
      renderer,
      email,
      notifier,
    }
  }
}

impl Harness {
  pub fn new() -> Self {
    HarnessBuilder::new().build()
  }

  pub async fn insert(&self, schedule: ScheduledReport) {
    self.repository.insert(schedule).await.unwrap();
  }

  pub async fn stored(&self, id: &str) -> ScheduledReport {
    use report_dispatch::collaborators::ScheduleRepository;
    self.repository.get(id).await.unwrap().unwrap()
  }
}
