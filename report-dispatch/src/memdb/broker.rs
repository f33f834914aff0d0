//! 内存 Broker trait 实现
//! Memory Broker trait implementation
//!
//! 每个操作在一次写锁内完成，因此对并发工作者是原子的
//! Each operation completes inside a single write lock, so it is atomic for concurrent workers

use crate::base::keys::JobState;
use crate::base::{Broker, QueueStats};
use crate::error::{Error, Result};
use crate::job::{JobInfo, JobMessage};
use crate::memdb::memory_broker::JobData;
use crate::memdb::MemoryBroker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

#[async_trait]
impl Broker for MemoryBroker {
  async fn ping(&self) -> Result<()> {
    // 内存存储始终可用
    // Memory storage is always available
    Ok(())
  }

  /// 将任务加入队列
  /// Enqueue a job into the queue
  async fn enqueue(&self, msg: &JobMessage, process_at: Option<DateTime<Utc>>) -> Result<JobInfo> {
    let mut storage = self.storage.write().await;

    // 检查任务是否已存在
    // Check if job already exists
    if storage.jobs.contains_key(&msg.id) {
      return Err(Error::JobIdConflict);
    }

    let delayed_until = process_at.filter(|at| *at > msg.enqueued_at);
    let data = match delayed_until {
      Some(at) => {
        storage.queue.push_delayed(&msg.id, at);
        JobData {
          message: msg.clone(),
          state: JobState::Delayed,
          process_at: Some(at),
          finished_at: None,
        }
      }
      None => {
        storage.queue.push_waiting(&msg.id, msg.priority);
        JobData {
          message: msg.clone(),
          state: JobState::Waiting,
          process_at: None,
          finished_at: None,
        }
      }
    };
    let info = data.info();
    storage.jobs.insert(msg.id.clone(), data);
    Ok(info)
  }

  fn queue_name(&self) -> &str {
    &self.queue
  }

  /// 从队列中取出任务
  /// Dequeue a job from the queue
  async fn dequeue(&self, lease_until: DateTime<Utc>) -> Result<Option<JobMessage>> {
    let mut storage = self.storage.write().await;

    // 检查队列是否暂停
    // Check if queue is paused
    if storage.queue.paused {
      return Ok(None);
    }

    while let Some((_, id)) = storage.queue.waiting.pop_first() {
      if let Some(job) = storage.jobs.get_mut(&id) {
        job.state = JobState::Active;
        let message = job.message.clone();
        storage.queue.active.insert(id, lease_until);
        return Ok(Some(message));
      }
    }

    Ok(None)
  }

  async fn extend_lease(&self, id: &str, lease_until: DateTime<Utc>) -> Result<bool> {
    let mut storage = self.storage.write().await;
    match storage.queue.active.get_mut(id) {
      Some(lease) => {
        *lease = lease_until;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>> {
    let storage = self.storage.read().await;
    let mut expired: Vec<(DateTime<Utc>, JobMessage)> = storage
      .queue
      .active
      .iter()
      .filter(|(_, lease)| **lease < now)
      .filter_map(|(id, lease)| storage.jobs.get(id).map(|job| (*lease, job.message.clone())))
      .collect();
    expired.sort_by_key(|(lease, _)| *lease);
    Ok(expired.into_iter().map(|(_, msg)| msg).collect())
  }

  /// 标记任务为完成
  /// Mark a job as done
  async fn done(&self, msg: &JobMessage, now: DateTime<Utc>) -> Result<()> {
    let mut storage = self.storage.write().await;
    if storage.queue.active.remove(&msg.id).is_none() {
      return Err(Error::JobNotFound { id: msg.id.clone() });
    }
    if let Some(job) = storage.jobs.get_mut(&msg.id) {
      job.state = JobState::Completed;
      job.finished_at = Some(now);
      job.process_at = None;
    }
    let limit = self.completed_retention;
    storage.retain_finished(JobState::Completed, &msg.id, limit);
    Ok(())
  }

  /// 重新调度任务进行重试
  /// Schedule a job for retry
  async fn retry(&self, msg: &JobMessage, process_at: DateTime<Utc>, error_msg: &str) -> Result<()> {
    let mut storage = self.storage.write().await;
    if storage.queue.active.remove(&msg.id).is_none() {
      return Err(Error::JobNotFound { id: msg.id.clone() });
    }
    if let Some(job) = storage.jobs.get_mut(&msg.id) {
      job.message.attempt = msg.attempt + 1;
      job.message.last_error = Some(error_msg.to_string());
      job.state = JobState::Delayed;
      job.process_at = Some(process_at);
    }
    storage.queue.push_delayed(&msg.id, process_at);
    Ok(())
  }

  /// 任务最终失败
  /// Terminally fail a job
  async fn fail(&self, msg: &JobMessage, error_msg: &str, now: DateTime<Utc>) -> Result<()> {
    let mut storage = self.storage.write().await;
    if storage.queue.active.remove(&msg.id).is_none() {
      return Err(Error::JobNotFound { id: msg.id.clone() });
    }
    if let Some(job) = storage.jobs.get_mut(&msg.id) {
      job.message.attempt = msg.attempt + 1;
      job.message.last_error = Some(error_msg.to_string());
      job.state = JobState::Failed;
      job.finished_at = Some(now);
      job.process_at = None;
    }
    let limit = self.failed_retention;
    storage.retain_finished(JobState::Failed, &msg.id, limit);
    Ok(())
  }

  /// 将到期的延迟任务转发到等待队列
  /// Forward due delayed jobs to the waiting queue
  async fn forward_if_ready(&self, now: DateTime<Utc>) -> Result<usize> {
    let mut storage = self.storage.write().await;
    let cutoff = now.timestamp_millis();
    let mut forwarded = 0;

    while let Some(entry) = storage.queue.delayed.first_entry() {
      if entry.key().0 > cutoff {
        break;
      }
      let id = entry.remove();
      let priority = match storage.jobs.get_mut(&id) {
        Some(job) => {
          job.state = JobState::Waiting;
          job.process_at = None;
          job.message.priority
        }
        None => continue,
      };
      storage.queue.push_waiting(&id, priority);
      forwarded += 1;
    }

    Ok(forwarded)
  }

  /// 取消计划的未开始任务
  /// Cancel a schedule's jobs that have not started
  async fn cancel_for_schedule(&self, schedule_id: &str) -> Result<usize> {
    let mut storage = self.storage.write().await;
    let ids: HashSet<String> = storage
      .jobs
      .values()
      .filter(|job| {
        job.message.schedule_id == schedule_id
          && matches!(job.state, JobState::Waiting | JobState::Delayed)
      })
      .map(|job| job.message.id.clone())
      .collect();

    if ids.is_empty() {
      return Ok(0);
    }

    storage.queue.waiting.retain(|_, id| !ids.contains(id));
    storage.queue.delayed.retain(|_, id| !ids.contains(id));
    for id in &ids {
      storage.jobs.remove(id);
    }
    Ok(ids.len())
  }

  async fn stats(&self) -> Result<QueueStats> {
    let storage = self.storage.read().await;
    Ok(QueueStats {
      waiting: storage.queue.waiting.len(),
      active: storage.queue.active.len(),
      delayed: storage.queue.delayed.len(),
      completed: storage.queue.completed.len(),
      failed: storage.queue.failed.len(),
      paused: storage.queue.paused,
    })
  }

  async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<JobInfo>> {
    let storage = self.storage.read().await;
    let ids: Vec<&String> = match state {
      JobState::Waiting => storage.queue.waiting.values().collect(),
      JobState::Delayed => storage.queue.delayed.values().collect(),
      JobState::Active => storage.queue.active.keys().collect(),
      JobState::Completed => storage.queue.completed.iter().rev().collect(),
      JobState::Failed => storage.queue.failed.iter().rev().collect(),
    };
    let mut jobs: Vec<JobInfo> = ids
      .into_iter()
      .filter_map(|id| storage.jobs.get(id))
      .map(JobData::info)
      .collect();
    if !state.is_terminal() {
      jobs.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
    }
    jobs.truncate(limit);
    Ok(jobs)
  }

  async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
    let storage = self.storage.read().await;
    Ok(storage.jobs.get(id).map(JobData::info))
  }

  async fn pause(&self) -> Result<()> {
    self.storage.write().await.queue.paused = true;
    Ok(())
  }

  async fn unpause(&self) -> Result<()> {
    self.storage.write().await.queue.paused = false;
    Ok(())
  }

  /// 删除过期的终态任务
  /// Delete expired finished jobs
  async fn delete_expired(&self, state: JobState, older_than: DateTime<Utc>) -> Result<usize> {
    if !state.is_terminal() {
      return Err(Error::other(format!(
        "only finished jobs can expire, got {state}"
      )));
    }
    let mut storage = self.storage.write().await;
    let expired: HashSet<String> = storage
      .jobs
      .values()
      .filter(|job| job.state == state && job.finished_at.is_some_and(|at| at < older_than))
      .map(|job| job.message.id.clone())
      .collect();

    match state {
      JobState::Completed => storage.queue.completed.retain(|id| !expired.contains(id)),
      _ => storage.queue.failed.retain(|id| !expired.contains(id)),
    }
    for id in &expired {
      storage.jobs.remove(id);
    }
    Ok(expired.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::JobMessage;
  use crate::schedule::{Frequency, Owner, ReportType, ScheduledReport};
  use chrono::{Duration, TimeZone};

  fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
  }

  fn schedule(id: &str, report_type: ReportType) -> ScheduledReport {
    ScheduledReport::new(
      id,
      "tenant",
      report_type,
      format!("{report_type} report"),
      vec!["ops@example.com".to_string()],
      Frequency::Daily,
      now(),
      Owner {
        user_id: "u".into(),
        email: "owner@example.com".into(),
        name: None,
      },
    )
  }

  fn job(id: &str, report_type: ReportType) -> JobMessage {
    let s = schedule(id, report_type);
    JobMessage::scheduled(&s, s.next_run, 3, now())
  }

  #[tokio::test]
  async fn test_enqueue_rejects_duplicate_id() {
    let broker = MemoryBroker::new();
    let msg = job("s1", ReportType::Sales);
    broker.enqueue(&msg, None).await.unwrap();
    assert!(matches!(
      broker.enqueue(&msg, None).await,
      Err(Error::JobIdConflict)
    ));
    assert_eq!(broker.stats().await.unwrap().waiting, 1);
  }

  #[tokio::test]
  async fn test_dequeue_priority_then_fifo() {
    let broker = MemoryBroker::new();
    let menu = job("menu", ReportType::MenuPerformance);
    let sales_a = job("sales-a", ReportType::Sales);
    let finance = job("finance", ReportType::FinancialSummary);
    let sales_b = job("sales-b", ReportType::Sales);
    for msg in [&menu, &sales_a, &finance, &sales_b] {
      broker.enqueue(msg, None).await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(msg) = broker.dequeue(now()).await.unwrap() {
      order.push(msg.schedule_id);
    }
    assert_eq!(order, vec!["finance", "sales-a", "sales-b", "menu"]);
    assert_eq!(broker.stats().await.unwrap().active, 4);
  }

  #[tokio::test]
  async fn test_retry_and_forward() {
    let broker = MemoryBroker::new();
    let msg = job("s1", ReportType::Sales);
    broker.enqueue(&msg, None).await.unwrap();
    let claimed = broker.dequeue(now()).await.unwrap().unwrap();

    let retry_at = now() + Duration::seconds(60);
    broker.retry(&claimed, retry_at, "analytics down").await.unwrap();
    let stats = broker.stats().await.unwrap();
    assert_eq!((stats.active, stats.delayed), (0, 1));

    assert_eq!(broker.forward_if_ready(now()).await.unwrap(), 0);
    assert_eq!(broker.forward_if_ready(retry_at).await.unwrap(), 1);

    let again = broker.dequeue(retry_at).await.unwrap().unwrap();
    assert_eq!(again.attempt, 1);
    assert_eq!(again.last_error.as_deref(), Some("analytics down"));
  }

  #[tokio::test]
  async fn test_cancel_leaves_active_job() {
    let broker = MemoryBroker::new();
    let s = schedule("s1", ReportType::Sales);
    let first = JobMessage::scheduled(&s, now(), 3, now());
    let second = JobMessage::scheduled(&s, now() + Duration::days(1), 3, now());
    let third = JobMessage::manual(&s, 3, now());
    broker.enqueue(&first, None).await.unwrap();
    let active = broker.dequeue(now()).await.unwrap().unwrap();
    broker.enqueue(&second, None).await.unwrap();
    broker
      .enqueue(&third, Some(now() + Duration::minutes(5)))
      .await
      .unwrap();

    assert_eq!(broker.cancel_for_schedule("s1").await.unwrap(), 2);
    let stats = broker.stats().await.unwrap();
    assert_eq!((stats.waiting, stats.delayed, stats.active), (0, 0, 1));

    broker.done(&active, now()).await.unwrap();
    assert_eq!(broker.stats().await.unwrap().completed, 1);
  }

  #[tokio::test]
  async fn test_retention_evicts_oldest() {
    let broker = MemoryBroker::new().with_retention(2, 1);
    for i in 0..3 {
      let msg = job(&format!("s{i}"), ReportType::Sales);
      broker.enqueue(&msg, None).await.unwrap();
      let claimed = broker.dequeue(now()).await.unwrap().unwrap();
      broker.done(&claimed, now()).await.unwrap();
    }
    let completed = broker.list_jobs(JobState::Completed, 10).await.unwrap();
    let ids: Vec<_> = completed.iter().map(|j| j.schedule_id.as_str()).collect();
    assert_eq!(ids, vec!["s2", "s1"]);
    assert!(broker.get_job(&job("s0", ReportType::Sales).id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_lease_expiry_and_extension() {
    let broker = MemoryBroker::new();
    let first = job("s1", ReportType::Sales);
    let second = job("s2", ReportType::Sales);
    broker.enqueue(&first, None).await.unwrap();
    broker.enqueue(&second, None).await.unwrap();
    let lease = now() + Duration::seconds(30);
    let a = broker.dequeue(lease).await.unwrap().unwrap();
    let b = broker.dequeue(lease).await.unwrap().unwrap();

    assert!(broker.list_lease_expired(lease).await.unwrap().is_empty());
    assert!(broker
      .extend_lease(&b.id, lease + Duration::seconds(30))
      .await
      .unwrap());
    let expired = broker
      .list_lease_expired(lease + Duration::seconds(1))
      .await
      .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, a.id);

    broker.done(&b, now()).await.unwrap();
    assert!(!broker.extend_lease(&b.id, lease).await.unwrap());
    assert_eq!(broker.queue_name(), "scheduled-reports");
    assert_eq!(MemoryBroker::with_queue("reports").queue_name(), "reports");
  }

  #[tokio::test]
  async fn test_pause_blocks_dequeue() {
    let broker = MemoryBroker::new();
    broker.enqueue(&job("s1", ReportType::Sales), None).await.unwrap();
    broker.pause().await.unwrap();
    assert!(broker.dequeue(now()).await.unwrap().is_none());
    assert!(broker.stats().await.unwrap().paused);
    broker.unpause().await.unwrap();
    assert!(broker.dequeue(now()).await.unwrap().is_some());
  }

  #[tokio::test]
  async fn test_delete_expired() {
    let broker = MemoryBroker::new();
    let msg = job("s1", ReportType::Sales);
    broker.enqueue(&msg, None).await.unwrap();
    let claimed = broker.dequeue(now()).await.unwrap().unwrap();
    broker.fail(&claimed, "boom", now()).await.unwrap();

    assert_eq!(broker.delete_expired(JobState::Failed, now()).await.unwrap(), 0);
    let later = now() + Duration::days(8);
    assert_eq!(broker.delete_expired(JobState::Failed, later).await.unwrap(), 1);
    assert_eq!(broker.stats().await.unwrap().failed, 0);
    assert!(broker.delete_expired(JobState::Waiting, later).await.is_err());
  }
}
