//! 任务模块
//! Job module
//!
//! 定义队列中的报表任务消息、任务信息以及重试策略
//! Defines the report job message stored in the queue, the observable job info and the retry policy

use crate::base::constants::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_BACKOFF_MULTIPLIER};
use crate::base::keys::JobState;
use crate::error::Result;
use crate::schedule::{Frequency, ReportFormat, ReportParameters, ReportType, ScheduledReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 任务触发方式
/// How a job was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
  Scheduled,
  Manual,
}

impl Trigger {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Scheduled => "scheduled",
      Self::Manual => "manual",
    }
  }
}

/// 生成任务 ID，同一计划的同一次触发总是得到相同的 ID
/// Generate a job id; the same trigger of the same schedule always yields the same id
pub fn generate_job_id(trigger: Trigger, schedule_id: &str, trigger_at: DateTime<Utc>) -> String {
  format!(
    "{}:{}:{}",
    trigger.as_str(),
    schedule_id,
    trigger_at.timestamp_millis()
  )
}

/// 入队时的计划快照
/// Snapshot of the schedule taken at enqueue time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
  pub report_type: ReportType,
  pub title: String,
  pub parameters: ReportParameters,
  pub recipients: Vec<String>,
  pub format: ReportFormat,
  pub frequency: Frequency,
}

impl From<&ScheduledReport> for JobPayload {
  fn from(schedule: &ScheduledReport) -> Self {
    Self {
      report_type: schedule.report_type,
      title: schedule.title.clone(),
      parameters: schedule.parameters.clone(),
      recipients: schedule.recipients.clone(),
      format: schedule.format,
      frequency: schedule.frequency,
    }
  }
}

/// 队列中的任务消息
/// Job message stored in the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
  pub id: String,
  pub trigger: Trigger,
  pub schedule_id: String,
  pub tenant_id: String,
  pub payload: JobPayload,
  pub priority: i32,
  /// 已经执行过的次数
  /// Attempts already made
  pub attempt: u32,
  pub max_attempts: u32,
  pub enqueued_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
}

impl JobMessage {
  /// 为计划的一次到期触发创建任务，`trigger_at` 是该次到期的 `next_run`
  /// Create a job for one due occurrence of a schedule; `trigger_at` is that occurrence's `next_run`
  pub fn scheduled(
    schedule: &ScheduledReport,
    trigger_at: DateTime<Utc>,
    max_attempts: u32,
    now: DateTime<Utc>,
  ) -> Self {
    Self::build(schedule, Trigger::Scheduled, trigger_at, max_attempts, now)
  }

  /// 手动触发的任务
  /// Manually triggered job
  pub fn manual(schedule: &ScheduledReport, max_attempts: u32, now: DateTime<Utc>) -> Self {
    Self::build(schedule, Trigger::Manual, now, max_attempts, now)
  }

  fn build(
    schedule: &ScheduledReport,
    trigger: Trigger,
    trigger_at: DateTime<Utc>,
    max_attempts: u32,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      id: generate_job_id(trigger, &schedule.id, trigger_at),
      trigger,
      schedule_id: schedule.id.clone(),
      tenant_id: schedule.tenant_id.clone(),
      payload: JobPayload::from(schedule),
      priority: schedule.report_type.priority(),
      attempt: 0,
      max_attempts: max_attempts.max(1),
      enqueued_at: now,
      last_error: None,
    }
  }

  /// 再失败一次后是否还能重试
  /// Whether another failure still leaves room for a retry
  pub fn can_retry(&self) -> bool {
    self.attempt + 1 < self.max_attempts
  }

  pub fn encode(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  pub fn decode(data: &str) -> Result<Self> {
    Ok(serde_json::from_str(data)?)
  }
}

/// 任务信息
/// Job information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
  pub id: String,
  pub schedule_id: String,
  pub tenant_id: String,
  pub report_type: ReportType,
  pub trigger: Trigger,
  pub state: JobState,
  pub priority: i32,
  pub attempt: u32,
  pub max_attempts: u32,
  pub enqueued_at: DateTime<Utc>,
  pub process_at: Option<DateTime<Utc>>,
  pub finished_at: Option<DateTime<Utc>>,
  pub last_error: Option<String>,
}

impl JobInfo {
  pub fn from_message(
    msg: &JobMessage,
    state: JobState,
    process_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      id: msg.id.clone(),
      schedule_id: msg.schedule_id.clone(),
      tenant_id: msg.tenant_id.clone(),
      report_type: msg.payload.report_type,
      trigger: msg.trigger,
      state,
      priority: msg.priority,
      attempt: msg.attempt,
      max_attempts: msg.max_attempts,
      enqueued_at: msg.enqueued_at,
      process_at,
      finished_at,
      last_error: msg.last_error.clone(),
    }
  }
}

/// 重试策略
/// Retry policy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
  /// 固定延迟
  /// Fixed delay
  Fixed(Duration),
  /// 指数退避
  /// Exponential backoff
  Exponential {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// 是否添加 ±25% 随机抖动
    /// Whether to add ±25% random jitter
    jitter: bool,
  },
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::Exponential {
      base_delay: DEFAULT_BACKOFF_BASE,
      max_delay: DEFAULT_BACKOFF_MAX,
      multiplier: DEFAULT_BACKOFF_MULTIPLIER,
      jitter: false,
    }
  }
}

impl RetryPolicy {
  /// 计算第 `retry_count` 次重试（从 0 开始）之前的等待时间
  /// Delay before retry number `retry_count` (0-based)
  pub fn calculate_delay(&self, retry_count: u32) -> Duration {
    match self {
      RetryPolicy::Fixed(delay) => *delay,
      RetryPolicy::Exponential {
        base_delay,
        max_delay,
        multiplier,
        jitter,
      } => {
        let exp = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let mut delay = base_delay.as_secs_f64() * multiplier.powi(exp);
        if delay > max_delay.as_secs_f64() {
          delay = max_delay.as_secs_f64();
        }

        if *jitter {
          use rand::Rng;
          let mut rng = rand::rng();
          let jitter_factor = rng.random_range(0.75..=1.25);
          delay *= jitter_factor;
        }

        Duration::from_secs_f64(delay)
      }
    }
  }
}
