//! 失败追踪模块
//! Failure tracker module
//!
//! 将任务的最终结果写回计划：追加执行历史、维护连续失败计数，超过上限时停用计划并通知所有者
//! Writes terminal job outcomes back to the schedule: appends history, maintains the
//! consecutive failure count, and disables the schedule and notifies its owner past the limit

use crate::base::constants::FAILURE_EMAIL_TEMPLATE;
use crate::clock::Clock;
use crate::collaborators::{FailureNotice, OwnerNotifier, ScheduleRepository};
use crate::error::Result;
use crate::handler::JobOutcome;
use crate::job::JobMessage;
use crate::schedule::{ExecutionEffect, ExecutionRecord, ScheduledReport};
use std::sync::Arc;

/// 失败追踪器
/// Failure tracker
pub struct FailureTracker {
  repository: Arc<dyn ScheduleRepository>,
  notifier: Arc<dyn OwnerNotifier>,
  clock: Arc<dyn Clock>,
}

impl FailureTracker {
  pub fn new(
    repository: Arc<dyn ScheduleRepository>,
    notifier: Arc<dyn OwnerNotifier>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      repository,
      notifier,
      clock,
    }
  }

  /// 记录成功执行
  /// Record a successful execution
  pub async fn record_success(&self, job: &JobMessage, outcome: &JobOutcome) -> Result<()> {
    let record = ExecutionRecord::success(
      outcome.report_id.clone(),
      outcome.duration_ms,
      outcome.recipient_count,
      outcome.failed_recipients.clone(),
      self.clock.now(),
    );
    if self
      .repository
      .record_execution(&job.schedule_id, record)
      .await?
      .is_none()
    {
      tracing::warn!(
        "Schedule {} no longer exists, dropping success of job {}",
        job.schedule_id,
        job.id
      );
    }
    Ok(())
  }

  /// 记录最终失败，必要时停用计划并通知所有者
  /// Record a terminal failure, disabling the schedule and notifying the owner when needed
  ///
  /// 返回更新后的执行影响，计划已被删除时返回 `None`
  /// Returns the resulting effect, or `None` when the schedule has been deleted
  pub async fn record_failure(
    &self,
    job: &JobMessage,
    error_message: &str,
    duration_ms: u64,
  ) -> Result<Option<ExecutionEffect>> {
    let record = ExecutionRecord::failure(error_message.to_string(), duration_ms, self.clock.now());
    let Some((schedule, effect)) = self
      .repository
      .record_execution(&job.schedule_id, record)
      .await?
    else {
      tracing::warn!(
        "Schedule {} no longer exists, dropping failure of job {}",
        job.schedule_id,
        job.id
      );
      return Ok(None);
    };

    if effect.disabled_now {
      tracing::warn!(
        "Schedule {} disabled after {} consecutive failures",
        schedule.id,
        effect.failure_count
      );
      self.notify(&schedule, error_message, effect).await;
    }
    Ok(Some(effect))
  }

  async fn notify(&self, schedule: &ScheduledReport, error_message: &str, effect: ExecutionEffect) {
    let notice = FailureNotice {
      subject: format!("Scheduled Report Failed: {}", schedule.title),
      template: FAILURE_EMAIL_TEMPLATE.to_string(),
      report_title: schedule.title.clone(),
      error_message: error_message.to_string(),
      failure_count: effect.failure_count,
      max_failures: schedule.max_failures,
      schedule_id: schedule.id.clone(),
      owner: schedule.created_by.clone(),
      will_disable: true,
    };
    if let Err(e) = self.notifier.notify_owner(schedule, &notice).await {
      tracing::error!(
        "Failed to notify owner {} of schedule {}: {}",
        schedule.created_by.email,
        schedule.id,
        e
      );
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::collaborators::CollaboratorError;
  use crate::memdb::MemoryScheduleRepository;
  use crate::schedule::{Frequency, Owner, ReportType};
  use async_trait::async_trait;
  use chrono::{TimeZone, Utc};
  use std::sync::Mutex;

  #[derive(Default)]
  struct RecordingNotifier(Mutex<Vec<FailureNotice>>);

  #[async_trait]
  impl OwnerNotifier for RecordingNotifier {
    async fn notify_owner(
      &self,
      _schedule: &ScheduledReport,
      notice: &FailureNotice,
    ) -> std::result::Result<(), CollaboratorError> {
      self.0.lock().unwrap().push(notice.clone());
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_disable_notifies_once() {
    let now = Utc.with_ymd_and_hms(2024, 2, 1, 7, 0, 0).unwrap();
    let repo = Arc::new(MemoryScheduleRepository::new());
    let mut schedule = ScheduledReport::new(
      "s1",
      "t1",
      ReportType::Sales,
      "Daily sales",
      vec!["a@example.com".into()],
      Frequency::Daily,
      now,
      Owner {
        user_id: "u1".into(),
        email: "owner@example.com".into(),
        name: Some("Owner".into()),
      },
    );
    schedule.max_failures = 5;
    schedule.failure_count = 4;
    repo.insert(schedule.clone()).await.unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let tracker = FailureTracker::new(
      repo.clone(),
      notifier.clone(),
      Arc::new(ManualClock::new(now)),
    );
    let job = JobMessage::scheduled(&schedule, now, 3, now);

    let effect = tracker
      .record_failure(&job, "analytics unavailable", 12)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(effect.failure_count, 5);
    assert!(effect.disabled_now);

    tracker.record_failure(&job, "again", 3).await.unwrap();

    let notices = notifier.0.lock().unwrap();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].subject, "Scheduled Report Failed: Daily sales");
    assert_eq!(notices[0].error_message, "analytics unavailable");
    assert_eq!(notices[0].failure_count, 5);

    let stored = repo.get("s1").await.unwrap().unwrap();
    assert!(!stored.is_active);
    assert_eq!(stored.execution_history.len(), 2);
  }

  #[tokio::test]
  async fn test_missing_schedule_is_ignored() {
    let now = Utc.with_ymd_and_hms(2024, 2, 1, 7, 0, 0).unwrap();
    let repo = Arc::new(MemoryScheduleRepository::new());
    let schedule = ScheduledReport::new(
      "gone",
      "t1",
      ReportType::Sales,
      "Gone",
      vec!["a@example.com".into()],
      Frequency::Daily,
      now,
      Owner {
        user_id: "u1".into(),
        email: "owner@example.com".into(),
        name: None,
      },
    );
    let tracker = FailureTracker::new(
      repo,
      Arc::new(RecordingNotifier::default()),
      Arc::new(ManualClock::new(now)),
    );
    let job = JobMessage::scheduled(&schedule, now, 3, now);
    assert!(tracker.record_failure(&job, "x", 1).await.unwrap().is_none());
  }
}
