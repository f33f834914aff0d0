//! 内存计划存储
//! In-memory schedule repository

use crate::collaborators::ScheduleRepository;
use crate::error::{Error, Result};
use crate::schedule::{ExecutionEffect, ExecutionRecord, ScheduledReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 基于内存的计划存储，每个修改在写锁内完成
/// Memory-backed schedule repository; every mutation happens under the write lock
#[derive(Clone, Default)]
pub struct MemoryScheduleRepository {
  schedules: Arc<RwLock<HashMap<String, ScheduledReport>>>,
}

impl MemoryScheduleRepository {
  pub fn new() -> Self {
    Self::default()
  }

  /// 校验并插入计划
  /// Validate and insert a schedule
  pub async fn insert(&self, schedule: ScheduledReport) -> Result<()> {
    schedule.validate()?;
    self
      .schedules
      .write()
      .await
      .insert(schedule.id.clone(), schedule);
    Ok(())
  }

  pub async fn remove(&self, id: &str) -> Option<ScheduledReport> {
    self.schedules.write().await.remove(id)
  }

  pub async fn len(&self) -> usize {
    self.schedules.read().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }
}

#[async_trait]
impl ScheduleRepository for MemoryScheduleRepository {
  async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledReport>> {
    let schedules = self.schedules.read().await;
    let mut due: Vec<ScheduledReport> = schedules
      .values()
      .filter(|s| s.is_due(now))
      .cloned()
      .collect();
    due.sort_by(|a, b| a.next_run.cmp(&b.next_run));
    Ok(due)
  }

  async fn get(&self, id: &str) -> Result<Option<ScheduledReport>> {
    Ok(self.schedules.read().await.get(id).cloned())
  }

  async fn save(&self, schedule: &ScheduledReport) -> Result<()> {
    self
      .schedules
      .write()
      .await
      .insert(schedule.id.clone(), schedule.clone());
    Ok(())
  }

  async fn advance_next_run(
    &self,
    id: &str,
    expected: DateTime<Utc>,
    next: DateTime<Utc>,
  ) -> Result<bool> {
    let mut schedules = self.schedules.write().await;
    let schedule = schedules
      .get_mut(id)
      .ok_or_else(|| Error::ScheduleNotFound { id: id.to_string() })?;
    if schedule.next_run != expected {
      return Ok(false);
    }
    schedule.next_run = next;
    Ok(true)
  }

  async fn record_execution(
    &self,
    id: &str,
    record: ExecutionRecord,
  ) -> Result<Option<(ScheduledReport, ExecutionEffect)>> {
    let mut schedules = self.schedules.write().await;
    Ok(schedules.get_mut(id).map(|schedule| {
      let effect = schedule.record_execution(record);
      (schedule.clone(), effect)
    }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::schedule::{Frequency, Owner, ReportType};
  use chrono::{Duration, TimeZone};

  fn schedule(id: &str, next_run: DateTime<Utc>) -> ScheduledReport {
    ScheduledReport::new(
      id,
      "tenant",
      ReportType::Sales,
      "Sales",
      vec!["a@example.com".to_string()],
      Frequency::Daily,
      next_run,
      Owner {
        user_id: "u".into(),
        email: "owner@example.com".into(),
        name: None,
      },
    )
  }

  #[tokio::test]
  async fn test_find_due_filters_and_sorts() {
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
    let repo = MemoryScheduleRepository::new();
    repo.insert(schedule("late", now - Duration::minutes(1))).await.unwrap();
    repo.insert(schedule("early", now - Duration::hours(3))).await.unwrap();
    repo.insert(schedule("future", now + Duration::minutes(1))).await.unwrap();
    let mut inactive = schedule("inactive", now - Duration::hours(1));
    inactive.is_active = false;
    repo.insert(inactive).await.unwrap();

    let due: Vec<String> = repo
      .find_due(now)
      .await
      .unwrap()
      .into_iter()
      .map(|s| s.id)
      .collect();
    assert_eq!(due, vec!["early", "late"]);
  }

  #[tokio::test]
  async fn test_advance_next_run_is_compare_and_swap() {
    let now = Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
    let repo = MemoryScheduleRepository::new();
    repo.insert(schedule("s1", now)).await.unwrap();

    let next = now + Duration::days(1);
    assert!(repo.advance_next_run("s1", now, next).await.unwrap());
    assert!(!repo.advance_next_run("s1", now, next).await.unwrap());
    assert_eq!(repo.get("s1").await.unwrap().unwrap().next_run, next);
    assert!(repo.advance_next_run("missing", now, next).await.is_err());
  }
}
