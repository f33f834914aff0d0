//! 内存后端示例
//! In-memory dispatch demonstration
//!
//! 使用内存队列和模拟的协作服务运行引擎：发现到期计划、执行任务并查看执行历史。
//! Runs the engine with the in-memory queue and stand-in collaborators: detects due schedules,
//! executes their jobs and prints the resulting execution history.

use async_trait::async_trait;
use chrono::Utc;
use report_dispatch::collaborators::{
  AnalyticsProvider, AnalyticsQuery, CollaboratorError, EmailMessage, EmailSender, FailureNotice,
  OwnerNotifier, RenderRequest, RenderedReport, ReportData, ReportRenderer,
};
use report_dispatch::config::EngineConfig;
use report_dispatch::engine::Engine;
use report_dispatch::logging::init_tracing;
use report_dispatch::memdb::MemoryScheduleRepository;
use report_dispatch::schedule::{Frequency, Owner, ReportType, ScheduledReport};
use std::sync::Arc;
use std::time::Duration;

struct DemoAnalytics;

#[async_trait]
impl AnalyticsProvider for DemoAnalytics {
  async fn generate(
    &self,
    query: AnalyticsQuery,
  ) -> std::result::Result<ReportData, CollaboratorError> {
    Ok(serde_json::json!({
      "reportType": query.report_type.as_str(),
      "from": query.window.start.to_rfc3339(),
      "to": query.window.end.to_rfc3339(),
      "orders": 128,
    }))
  }
}

struct DemoRenderer;

#[async_trait]
impl ReportRenderer for DemoRenderer {
  async fn render(
    &self,
    request: RenderRequest,
  ) -> std::result::Result<RenderedReport, CollaboratorError> {
    let file_name = request.context.file_name;
    Ok(RenderedReport {
      report_id: uuid::Uuid::new_v4().to_string(),
      file_path: format!("/tmp/reports/{file_name}"),
      file_name,
    })
  }
}

/// 拒绝 bounce 域名的邮件服务
/// Email sender that rejects the bounce domain
struct DemoEmail;

#[async_trait]
impl EmailSender for DemoEmail {
  async fn send(&self, message: EmailMessage) -> std::result::Result<(), CollaboratorError> {
    if message.to.ends_with("@bounce.example.com") {
      return Err(CollaboratorError::Delivery("mailbox unavailable".into()));
    }
    println!("   ✉️  {} -> {}", message.subject, message.to);
    Ok(())
  }
}

struct DemoNotifier;

#[async_trait]
impl OwnerNotifier for DemoNotifier {
  async fn notify_owner(
    &self,
    _schedule: &ScheduledReport,
    notice: &FailureNotice,
  ) -> std::result::Result<(), CollaboratorError> {
    println!("   ⚠️  {} -> {}", notice.subject, notice.owner.email);
    Ok(())
  }
}

fn owner() -> Owner {
  Owner {
    user_id: "manager-1".into(),
    email: "manager@example.com".into(),
    name: Some("Branch Manager".into()),
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  init_tracing("report_dispatch=info")?;

  println!("📬 Report Dispatch Demo");
  println!("=======================");

  let now = Utc::now();
  let repository = Arc::new(MemoryScheduleRepository::new());
  repository
    .insert(ScheduledReport::new(
      "daily-sales",
      "tenant-1",
      ReportType::Sales,
      "Daily sales",
      vec![
        "owner@example.com".into(),
        "finance@bounce.example.com".into(),
      ],
      Frequency::Daily,
      now,
      owner(),
    ))
    .await?;
  repository
    .insert(ScheduledReport::new(
      "monthly-close",
      "tenant-1",
      ReportType::FinancialSummary,
      "Monthly close",
      vec!["cfo@example.com".into()],
      Frequency::Monthly,
      now,
      owner(),
    ))
    .await?;

  let config = EngineConfig::new()
    .concurrency(2)
    .job_check_interval(Duration::from_millis(100))
    .forward_interval(Duration::from_millis(500));
  let mut engine = Engine::builder()
    .config(config)
    .repository(repository.clone())
    .analytics(Arc::new(DemoAnalytics))
    .renderer(Arc::new(DemoRenderer))
    .email(Arc::new(DemoEmail))
    .notifier(Arc::new(DemoNotifier))
    .build()?;

  println!("\n🔎 Detecting due schedules:");
  let report = engine.poll_now().await?;
  println!(
    "   due={} enqueued={} skipped={}",
    report.due, report.enqueued, report.skipped
  );

  println!("\n🚀 Running jobs:");
  engine.start().await?;
  tokio::time::sleep(Duration::from_secs(2)).await;

  let stats = engine.get_queue_stats().await?;
  println!("\n📊 Queue: {:?}", stats);

  for id in ["monthly-close", "daily-sales"] {
    let page = engine.execution_history(id, 1, 10).await?;
    println!(
      "\n📋 {}: runs={} success rate={}% status={:?}",
      id, page.summary.total_runs, page.summary.success_rate, page.summary.status
    );
    for record in &page.records {
      println!(
        "   {:?} recipients={:?} failed={:?}",
        record.status, record.recipient_count, record.failed_recipients
      );
    }
  }

  engine.shutdown().await?;
  println!("\n✅ Done");
  Ok(())
}
