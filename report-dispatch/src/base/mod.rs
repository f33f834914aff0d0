//! 经纪人模块
//! Broker module
//!
//! 定义了与任务存储后端交互的抽象层，内存实现与 Redis 实现都遵循同一接口
//! Defines the abstraction layer over the job storage backend; the in-memory and Redis implementations share it

use crate::base::keys::JobState;
use crate::error::Result;
use crate::job::{JobInfo, JobMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod constants;
pub mod keys;

/// 经纪人特性，定义了报表任务队列的全部状态迁移
/// Broker trait, defines every state transition of the report job queue
///
/// 每个方法对并发的工作者（以及共享同一存储的其他进程）都是原子的
/// Each method is atomic with respect to concurrent workers, including other processes sharing the store
#[async_trait]
pub trait Broker: Send + Sync {
  /// 测试连接
  /// Ping the backing store
  async fn ping(&self) -> Result<()>;

  /// 将任务加入队列；`process_at` 在未来时进入 delayed
  /// Enqueue a job; a future `process_at` places it in delayed
  ///
  /// 相同 ID 的任务已存在时返回 `Error::JobIdConflict`
  /// Returns `Error::JobIdConflict` when a job with the same id already exists
  async fn enqueue(&self, msg: &JobMessage, process_at: Option<DateTime<Utc>>) -> Result<JobInfo>;

  /// 队列名称
  /// Queue name
  fn queue_name(&self) -> &str;

  /// 原子地取出优先级最高的等待任务并标记为 active，租约在 `lease_until` 到期
  /// Atomically pull the highest-priority waiting job and mark it active, leased until `lease_until`
  async fn dequeue(&self, lease_until: DateTime<Utc>) -> Result<Option<JobMessage>>;

  /// 延长 active 任务的租约；任务已不在 active 时返回 false
  /// Extend the lease of an active job; returns false once the job is no longer active
  async fn extend_lease(&self, id: &str, lease_until: DateTime<Utc>) -> Result<bool>;

  /// 列出租约在 `now` 之前到期的 active 任务
  /// List active jobs whose lease expired before `now`
  async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>>;

  /// 确认任务成功
  /// Acknowledge a successful job
  async fn done(&self, msg: &JobMessage, now: DateTime<Utc>) -> Result<()>;

  /// 任务失败后延迟重试
  /// Nack a job and retry it after a delay
  async fn retry(&self, msg: &JobMessage, process_at: DateTime<Utc>, error_msg: &str) -> Result<()>;

  /// 任务最终失败
  /// Mark a job as terminally failed
  async fn fail(&self, msg: &JobMessage, error_msg: &str, now: DateTime<Utc>) -> Result<()>;

  /// 将到期的 delayed 任务转回 waiting，返回转发数量
  /// Move due delayed jobs back to waiting, returns how many were forwarded
  async fn forward_if_ready(&self, now: DateTime<Utc>) -> Result<usize>;

  /// 删除某个计划所有 waiting/delayed 任务，active 任务不受影响
  /// Remove every waiting/delayed job of a schedule; active jobs are left alone
  async fn cancel_for_schedule(&self, schedule_id: &str) -> Result<usize>;

  /// 队列统计
  /// Queue statistics
  async fn stats(&self) -> Result<QueueStats>;

  /// 按状态列出任务，最新的在前
  /// List jobs in a state, newest first
  async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<JobInfo>>;

  /// 获取任务信息
  /// Get job info
  async fn get_job(&self, id: &str) -> Result<Option<JobInfo>>;

  /// 暂停队列，暂停期间不会取出任务
  /// Pause the queue; no job is claimed while paused
  async fn pause(&self) -> Result<()>;

  /// 恢复队列
  /// Resume the queue
  async fn unpause(&self) -> Result<()>;

  /// 删除在 `older_than` 之前结束的 completed 或 failed 任务
  /// Delete completed or failed jobs that finished before `older_than`
  async fn delete_expired(&self, state: JobState, older_than: DateTime<Utc>) -> Result<usize>;
}

/// 队列统计
/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
  pub waiting: usize,
  pub active: usize,
  pub delayed: usize,
  pub completed: usize,
  pub failed: usize,
  pub paused: bool,
}
