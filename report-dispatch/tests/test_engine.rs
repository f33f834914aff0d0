mod common;

use chrono::Duration as ChronoDuration;
use common::{
  schedule, start_time, wait_until, Harness, HarnessBuilder, RecordingAnalytics, RecordingEmail,
};
use report_dispatch::base::keys::JobState;
use report_dispatch::base::Broker;
use report_dispatch::components::janitor::CleanupReport;
use report_dispatch::engine::EngineState;
use report_dispatch::error::Error;
use report_dispatch::schedule::{ExecutionStatus, Frequency, ReportType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[tokio::test]
async fn test_due_schedules_dispatch_once_per_occurrence() {
  let mut h = Harness::new();
  let t0 = start_time();
  h.insert(schedule("daily", ReportType::Sales, Frequency::Daily, t0 - ChronoDuration::minutes(1)))
    .await;
  h.insert(schedule("weekly", ReportType::BranchPerformance, Frequency::Weekly, t0))
    .await;
  h.insert(schedule("later", ReportType::Sales, Frequency::Daily, t0 + ChronoDuration::hours(1)))
    .await;
  let mut inactive = schedule("inactive", ReportType::Sales, Frequency::Daily, t0);
  inactive.is_active = false;
  h.insert(inactive).await;

  let report = h.engine.poll_now().await.unwrap();
  assert_eq!(report.due, 2);
  assert_eq!(report.enqueued, 2);
  assert_eq!(h.engine.poll_now().await.unwrap().due, 0);
  assert_eq!(h.engine.get_queue_stats().await.unwrap().waiting, 2);

  assert_eq!(h.stored("daily").await.next_run, t0 + ChronoDuration::days(1));
  assert_eq!(h.stored("weekly").await.next_run, t0 + ChronoDuration::days(7));
  assert_eq!(h.stored("later").await.next_run, t0 + ChronoDuration::hours(1));

  h.engine.start().await.unwrap();
  let repo_done = wait_until(|| async {
    h.stored("daily").await.successful_runs == 1 && h.stored("weekly").await.successful_runs == 1
  })
  .await;
  assert!(repo_done);
  assert_eq!(h.analytics.calls(), 2);

  h.clock.advance(ChronoDuration::days(1));
  let report = h.engine.poll_now().await.unwrap();
  // "later" and "daily" are both due again, "weekly" is not
  assert_eq!(report.enqueued, 2);
  assert_eq!(h.stored("daily").await.next_run, t0 + ChronoDuration::days(2));
  assert!(wait_until(|| async { h.stored("daily").await.successful_runs == 2 }).await);

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_back_off_then_fail() {
  let mut h = HarnessBuilder::new()
    .analytics(RecordingAnalytics::failing(u32::MAX))
    .build();
  let t0 = start_time();
  let s = schedule("s1", ReportType::Sales, Frequency::Daily, t0 + ChronoDuration::days(1));
  h.insert(s.clone()).await;

  let info = h.engine.enqueue_now(&s).await.unwrap();
  assert_eq!(info.state, JobState::Waiting);
  h.engine.start().await.unwrap();

  let id = info.id.clone();
  let delayed_at = |attempt: u32| {
    let id = id.clone();
    let h = &h;
    async move {
      let job = h.engine.get_job(&id).await.unwrap();
      job.state == JobState::Delayed && job.attempt == attempt
    }
  };

  assert!(wait_until(|| delayed_at(1)).await);
  let job = h.engine.get_job(&info.id).await.unwrap();
  assert_eq!(job.process_at, Some(t0 + ChronoDuration::seconds(60)));
  assert!(job.last_error.unwrap().contains("analytics database down"));

  h.clock.advance(ChronoDuration::seconds(60));
  assert!(wait_until(|| delayed_at(2)).await);
  let job = h.engine.get_job(&info.id).await.unwrap();
  assert_eq!(job.process_at, Some(t0 + ChronoDuration::seconds(180)));

  h.clock.advance(ChronoDuration::seconds(120));
  assert!(wait_until(|| async { h.stored("s1").await.failure_count == 1 }).await);
  let job = h.engine.get_job(&info.id).await.unwrap();
  assert_eq!(job.state, JobState::Failed);
  assert_eq!(job.attempt, 3);

  h.clock.advance(ChronoDuration::seconds(240));
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(h.analytics.calls(), 3);

  let stored = h.stored("s1").await;
  assert!(stored.is_active);
  assert_eq!(stored.execution_history.len(), 1);
  assert_eq!(stored.execution_history[0].status, ExecutionStatus::Failure);
  assert!(h.notifier.notices.lock().unwrap().is_empty());

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_schedule_disabled_after_max_failures() {
  let mut h = HarnessBuilder::new()
    .config(|c| c.max_attempts(1))
    .analytics(RecordingAnalytics::failing(u32::MAX))
    .build();
  let t0 = start_time();
  let mut s = schedule("s1", ReportType::FinancialSummary, Frequency::Daily, t0);
  s.title = "Monthly close".into();
  s.max_failures = 5;
  s.failure_count = 4;
  h.insert(s).await;

  assert_eq!(h.engine.poll_now().await.unwrap().enqueued, 1);
  h.engine.start().await.unwrap();
  assert!(wait_until(|| async { !h.stored("s1").await.is_active }).await);
  assert!(wait_until(|| async { !h.notifier.notices.lock().unwrap().is_empty() }).await);

  let stored = h.stored("s1").await;
  assert_eq!(stored.failure_count, 5);
  {
    let notices = h.notifier.notices.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].report_title, "Monthly close");
    assert_eq!(notices[0].subject, "Scheduled Report Failed: Monthly close");
    assert!(notices[0].error_message.contains("analytics database down"));
    assert_eq!(notices[0].failure_count, 5);
    assert_eq!(notices[0].max_failures, 5);
    assert_eq!(notices[0].owner.email, "owner@example.com");
  }

  h.clock.advance(ChronoDuration::days(1));
  assert_eq!(h.engine.poll_now().await.unwrap().due, 0);
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(h.notifier.notices.lock().unwrap().len(), 1);

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_partial_delivery_is_success() {
  let mut h = HarnessBuilder::new()
    .email(RecordingEmail::failing_for(&["b@example.com"]))
    .build();
  let mut s = schedule(
    "s1",
    ReportType::Sales,
    Frequency::Daily,
    start_time() + ChronoDuration::days(1),
  );
  s.recipients = vec![
    "a@example.com".into(),
    "b@example.com".into(),
    "c@example.com".into(),
  ];
  h.insert(s.clone()).await;

  h.engine.enqueue_now(&s).await.unwrap();
  h.engine.start().await.unwrap();
  assert!(wait_until(|| async { h.stored("s1").await.successful_runs == 1 }).await);

  let stored = h.stored("s1").await;
  assert_eq!(stored.failure_count, 0);
  let record = &stored.execution_history[0];
  assert_eq!(record.status, ExecutionStatus::Success);
  assert_eq!(record.recipient_count, Some(3));
  assert_eq!(record.failed_recipients, vec!["b@example.com".to_string()]);
  assert_eq!(h.email.sent.lock().unwrap().len(), 2);
  assert_eq!(h.engine.get_queue_stats().await.unwrap().completed, 1);

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_abandoned_job_is_recovered_and_retried() {
  let mut h = HarnessBuilder::new()
    .config(|c| c.recover_interval(Duration::from_millis(10)))
    .immediate_retries()
    .build();
  let t0 = start_time();
  h.insert(schedule("s1", ReportType::Sales, Frequency::Daily, t0))
    .await;
  assert_eq!(h.engine.poll_now().await.unwrap().enqueued, 1);

  // claimed by a worker that never acknowledges it
  let claimed = h
    .broker
    .dequeue(t0 + ChronoDuration::seconds(30))
    .await
    .unwrap()
    .unwrap();

  h.engine.start().await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(h.engine.get_queue_stats().await.unwrap().active, 1);
  assert_eq!(h.analytics.calls(), 0);

  h.clock.advance(ChronoDuration::seconds(31));
  assert!(wait_until(|| async { h.stored("s1").await.successful_runs == 1 }).await);

  let job = h.engine.get_job(&claimed.id).await.unwrap();
  assert_eq!(job.state, JobState::Completed);
  assert_eq!(job.attempt, 1);
  assert!(job.last_error.unwrap().contains("lease expired"));
  assert_eq!(h.analytics.calls(), 1);
  let stored = h.stored("s1").await;
  assert_eq!(stored.failure_count, 0);
  assert_eq!(stored.execution_history.len(), 1);

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_higher_priority_is_dispatched_first() {
  let mut h = Harness::new();
  let later = start_time() + ChronoDuration::days(1);
  let menu = schedule("menu", ReportType::MenuPerformance, Frequency::Daily, later);
  let financial = schedule("financial", ReportType::FinancialSummary, Frequency::Daily, later);
  h.insert(menu.clone()).await;
  h.insert(financial.clone()).await;

  h.engine.enqueue_now(&menu).await.unwrap();
  h.engine.enqueue_now(&financial).await.unwrap();
  h.engine.start().await.unwrap();
  assert!(wait_until(|| async { h.renderer.rendered_types().len() == 2 }).await);

  assert_eq!(
    h.renderer.rendered_types(),
    vec![ReportType::FinancialSummary, ReportType::MenuPerformance]
  );
  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_keeps_active_job() {
  let gate = Arc::new(Semaphore::new(0));
  let mut h = HarnessBuilder::new()
    .analytics(RecordingAnalytics::gated(gate.clone()))
    .build();
  let s = schedule(
    "s1",
    ReportType::Sales,
    Frequency::Daily,
    start_time() + ChronoDuration::days(1),
  );
  h.insert(s.clone()).await;

  let running = h.engine.enqueue_now(&s).await.unwrap();
  h.engine.start().await.unwrap();
  assert!(wait_until(|| async { h.analytics.calls() == 1 }).await);

  h.clock.advance(ChronoDuration::milliseconds(1));
  h.engine.enqueue_now(&s).await.unwrap();
  h.clock.advance(ChronoDuration::milliseconds(1));
  let delayed = h
    .engine
    .enqueue_in(&s, Duration::from_secs(600))
    .await
    .unwrap();
  assert_eq!(delayed.state, JobState::Delayed);

  let stats = h.engine.get_queue_stats().await.unwrap();
  assert_eq!((stats.active, stats.waiting, stats.delayed), (1, 1, 1));

  assert_eq!(h.engine.cancel_jobs_for_schedule("s1").await.unwrap(), 2);
  let stats = h.engine.get_queue_stats().await.unwrap();
  assert_eq!((stats.active, stats.waiting, stats.delayed), (1, 0, 0));
  assert!(matches!(
    h.engine.get_job(&delayed.id).await,
    Err(Error::JobNotFound { .. })
  ));

  gate.add_permits(1);
  assert!(wait_until(|| async { h.stored("s1").await.successful_runs == 1 }).await);
  let job = h.engine.get_job(&running.id).await.unwrap();
  assert_eq!(job.state, JobState::Completed);
  assert_eq!(h.analytics.calls(), 1);

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_paused_queue_holds_jobs() {
  let mut h = Harness::new();
  let s = schedule(
    "s1",
    ReportType::Sales,
    Frequency::Daily,
    start_time() + ChronoDuration::days(1),
  );
  h.insert(s.clone()).await;

  h.engine.pause_queue().await.unwrap();
  h.engine.enqueue_now(&s).await.unwrap();
  h.engine.start().await.unwrap();
  tokio::time::sleep(Duration::from_millis(100)).await;

  let stats = h.engine.get_queue_stats().await.unwrap();
  assert!(stats.paused);
  assert_eq!(stats.waiting, 1);
  assert_eq!(h.analytics.calls(), 0);

  h.engine.resume_queue().await.unwrap();
  assert!(wait_until(|| async { h.stored("s1").await.successful_runs == 1 }).await);
  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delayed_manual_job_is_forwarded() {
  let mut h = Harness::new();
  let t0 = start_time();
  let s = schedule("s1", ReportType::Sales, Frequency::Daily, t0 + ChronoDuration::days(1));
  h.insert(s.clone()).await;

  let info = h
    .engine
    .enqueue_in(&s, Duration::from_secs(600))
    .await
    .unwrap();
  assert_eq!(info.state, JobState::Delayed);
  assert_eq!(info.process_at, Some(t0 + ChronoDuration::minutes(10)));

  h.engine.start().await.unwrap();
  tokio::time::sleep(Duration::from_millis(50)).await;
  assert_eq!(h.engine.get_queue_stats().await.unwrap().delayed, 1);
  assert_eq!(h.analytics.calls(), 0);

  h.clock.advance(ChronoDuration::minutes(10));
  assert!(wait_until(|| async { h.stored("s1").await.successful_runs == 1 }).await);
  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_history_recent_jobs_and_cleanup() {
  let mut h = HarnessBuilder::new()
    .config(|c| c.max_attempts(1))
    .analytics(RecordingAnalytics::failing(1))
    .build();
  let t0 = start_time();
  let s = schedule("s1", ReportType::Sales, Frequency::Daily, t0 + ChronoDuration::days(30));
  h.insert(s.clone()).await;

  h.engine.start().await.unwrap();
  h.engine.enqueue_now(&s).await.unwrap();
  assert!(wait_until(|| async { h.stored("s1").await.total_runs == 1 }).await);
  h.clock.advance(ChronoDuration::minutes(1));
  h.engine.enqueue_now(&s).await.unwrap();
  assert!(wait_until(|| async { h.stored("s1").await.total_runs == 2 }).await);

  let page = h.engine.execution_history("s1", 1, 1).await.unwrap();
  assert_eq!(page.total, 2);
  assert_eq!(page.pages, 2);
  assert_eq!(page.records[0].status, ExecutionStatus::Success);
  assert_eq!(page.summary.successful_runs, 1);
  assert_eq!(page.summary.failed_runs, 1);
  assert_eq!(page.summary.success_rate, 50);
  assert_eq!(page.summary.failure_count, 0);
  let second = h.engine.execution_history("s1", 2, 1).await.unwrap();
  assert_eq!(second.records[0].status, ExecutionStatus::Failure);

  let recent = h.engine.get_recent_jobs(10).await.unwrap();
  assert_eq!(recent.len(), 2);
  assert_eq!(recent[0].state, JobState::Completed);
  assert_eq!(recent[1].state, JobState::Failed);

  h.clock.advance(ChronoDuration::days(8));
  let cleaned = h.engine.clean_queue().await.unwrap();
  assert_eq!(
    cleaned,
    CleanupReport {
      completed: 1,
      failed: 1
    }
  );
  assert!(h.engine.get_recent_jobs(10).await.unwrap().is_empty());

  h.engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_engine_lifecycle() {
  let mut h = Harness::new();
  assert_eq!(h.engine.state(), EngineState::New);
  h.engine.start().await.unwrap();
  assert!(matches!(h.engine.start().await, Err(Error::EngineRunning)));

  h.engine.shutdown().await.unwrap();
  assert_eq!(h.engine.state(), EngineState::Closed);
  assert!(matches!(h.engine.start().await, Err(Error::EngineClosed)));
  assert!(matches!(h.engine.poll_now().await, Err(Error::EngineClosed)));

  let s = schedule("s1", ReportType::Sales, Frequency::Daily, start_time());
  assert!(matches!(
    h.engine.enqueue_now(&s).await,
    Err(Error::EngineClosed)
  ));
}
