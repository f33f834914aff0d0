//! 检查器模块
//! Inspector module
//!
//! 提供队列统计、最近任务以及计划执行历史的只读视图
//! Read-only views over queue statistics, recent jobs and schedule execution history

use crate::base::keys::JobState;
use crate::base::{Broker, QueueStats};
use crate::clock::Clock;
use crate::collaborators::ScheduleRepository;
use crate::error::{Error, Result};
use crate::job::JobInfo;
use crate::schedule::{ExecutionRecord, ScheduleStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Pagination specifies the page size and page number for history listings.
/// 分页结构体，指定历史列表的页面大小和页面编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
  /// Page number starting from one.
  /// 从一开始的页面编号
  pub page: usize,
  /// Number of items in the page.
  /// 每页的项目数
  pub limit: usize,
}

impl Pagination {
  pub fn new(page: usize, limit: usize) -> Self {
    Self {
      page: page.max(1),
      limit: limit.max(1),
    }
  }

  /// Returns the start index for the current page.
  /// 返回当前页面的起始索引
  pub fn start(&self) -> usize {
    (self.page - 1).saturating_mul(self.limit)
  }

  /// Total number of pages for `total` items.
  /// 共 `total` 条记录时的页数
  pub fn pages(&self, total: usize) -> usize {
    total.div_ceil(self.limit)
  }
}

impl Default for Pagination {
  fn default() -> Self {
    Pagination { page: 1, limit: 20 }
  }
}

/// 执行历史汇总
/// Execution history summary
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySummary {
  pub total_runs: u64,
  pub successful_runs: u64,
  pub failed_runs: u64,
  /// 四舍五入的百分比
  /// Rounded percentage
  pub success_rate: u32,
  pub last_run: Option<DateTime<Utc>>,
  pub last_success: Option<DateTime<Utc>>,
  pub last_failure: Option<DateTime<Utc>>,
  pub failure_count: u32,
  pub status: ScheduleStatus,
}

/// 一页执行历史
/// One page of execution history
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
  /// 按时间倒序
  /// Newest first
  pub records: Vec<ExecutionRecord>,
  pub pagination: Pagination,
  pub total: usize,
  pub pages: usize,
  pub summary: HistorySummary,
}

/// 检查器
/// Inspector
pub struct Inspector {
  broker: Arc<dyn Broker>,
  repository: Arc<dyn ScheduleRepository>,
  clock: Arc<dyn Clock>,
}

impl Inspector {
  /// 创建新的检查器
  /// Create a new inspector
  pub fn new(
    broker: Arc<dyn Broker>,
    repository: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      broker,
      repository,
      clock,
    }
  }

  /// 获取队列统计信息
  /// Get queue statistics
  pub async fn get_queue_stats(&self) -> Result<QueueStats> {
    self.broker.stats().await
  }

  /// 获取所有状态中最近的任务，按入队时间倒序
  /// Get the most recent jobs across all states, newest enqueue first
  pub async fn get_recent_jobs(&self, limit: usize) -> Result<Vec<JobInfo>> {
    let mut jobs = Vec::new();
    for state in [
      JobState::Active,
      JobState::Waiting,
      JobState::Delayed,
      JobState::Completed,
      JobState::Failed,
    ] {
      jobs.extend(self.broker.list_jobs(state, limit).await?);
    }
    jobs.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
    jobs.truncate(limit);
    Ok(jobs)
  }

  /// 获取任务信息
  /// Get job information
  pub async fn get_job(&self, id: &str) -> Result<JobInfo> {
    self
      .broker
      .get_job(id)
      .await?
      .ok_or_else(|| Error::JobNotFound { id: id.to_string() })
  }

  /// 分页获取计划的执行历史
  /// Get a page of a schedule's execution history
  pub async fn execution_history(
    &self,
    schedule_id: &str,
    pagination: Pagination,
  ) -> Result<HistoryPage> {
    let schedule = self
      .repository
      .get(schedule_id)
      .await?
      .ok_or_else(|| Error::ScheduleNotFound {
        id: schedule_id.to_string(),
      })?;

    let mut history = schedule.execution_history.clone();
    history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let total = history.len();
    let records = history
      .into_iter()
      .skip(pagination.start())
      .take(pagination.limit)
      .collect();

    Ok(HistoryPage {
      records,
      pagination,
      total,
      pages: pagination.pages(total),
      summary: HistorySummary {
        total_runs: schedule.total_runs,
        successful_runs: schedule.successful_runs,
        failed_runs: schedule.total_runs.saturating_sub(schedule.successful_runs),
        success_rate: schedule.success_rate(),
        last_run: schedule.last_run,
        last_success: schedule.last_success,
        last_failure: schedule.last_failure,
        failure_count: schedule.failure_count,
        status: schedule.status(self.clock.now()),
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::job::JobMessage;
  use crate::memdb::{MemoryBroker, MemoryScheduleRepository};
  use crate::schedule::{ExecutionRecord, Frequency, Owner, ReportType, ScheduledReport};
  use chrono::{Duration, TimeZone};

  fn schedule(id: &str, report_type: ReportType, now: DateTime<Utc>) -> ScheduledReport {
    ScheduledReport::new(
      id,
      "t1",
      report_type,
      "Report",
      vec!["a@example.com".into()],
      Frequency::Daily,
      now + Duration::days(1),
      Owner {
        user_id: "u".into(),
        email: "o@example.com".into(),
        name: None,
      },
    )
  }

  #[test]
  fn test_pagination() {
    let p = Pagination::new(0, 0);
    assert_eq!(p, Pagination { page: 1, limit: 1 });
    let p = Pagination::new(2, 20);
    assert_eq!(p.start(), 20);
    assert_eq!(p.pages(41), 3);
    assert_eq!(Pagination::default().limit, 20);
  }

  #[tokio::test]
  async fn test_execution_history_pages_newest_first() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let repo = Arc::new(MemoryScheduleRepository::new());
    let mut s = schedule("s1", ReportType::Sales, now);
    for i in 0..5 {
      let at = now - Duration::hours(5 - i);
      let record = if i == 4 {
        ExecutionRecord::failure("boom".into(), 5, at)
      } else {
        ExecutionRecord::success(format!("r{i}"), 5, 1, Vec::new(), at)
      };
      s.record_execution(record);
    }
    repo.insert(s).await.unwrap();

    let inspector = Inspector::new(
      Arc::new(MemoryBroker::new()),
      repo,
      Arc::new(ManualClock::new(now)),
    );
    let page = inspector
      .execution_history("s1", Pagination::new(1, 2))
      .await
      .unwrap();
    assert_eq!(page.total, 5);
    assert_eq!(page.pages, 3);
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].error.as_deref(), Some("boom"));
    assert_eq!(page.records[1].report_id.as_deref(), Some("r3"));
    assert_eq!(page.summary.total_runs, 5);
    assert_eq!(page.summary.failed_runs, 1);
    assert_eq!(page.summary.success_rate, 80);
    assert_eq!(page.summary.status, ScheduleStatus::Failed);

    assert!(matches!(
      inspector
        .execution_history("missing", Pagination::default())
        .await,
      Err(Error::ScheduleNotFound { .. })
    ));
  }

  #[tokio::test]
  async fn test_recent_jobs_across_states() {
    let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
    let broker = Arc::new(MemoryBroker::new());
    let first = schedule("s1", ReportType::Sales, now);
    let second = schedule("s2", ReportType::MenuPerformance, now);

    broker
      .enqueue(&JobMessage::manual(&first, 3, now), None)
      .await
      .unwrap();
    let claimed = broker.dequeue(now).await.unwrap().unwrap();
    broker.done(&claimed, now).await.unwrap();
    broker
      .enqueue(
        &JobMessage::manual(&second, 3, now + Duration::seconds(1)),
        None,
      )
      .await
      .unwrap();

    let inspector = Inspector::new(
      broker,
      Arc::new(MemoryScheduleRepository::new()),
      Arc::new(ManualClock::new(now)),
    );
    let jobs = inspector.get_recent_jobs(10).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].schedule_id, "s2");
    assert_eq!(jobs[0].state, JobState::Waiting);
    assert_eq!(jobs[1].state, JobState::Completed);
    assert_eq!(inspector.get_recent_jobs(1).await.unwrap().len(), 1);
  }
}
