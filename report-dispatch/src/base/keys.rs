//! 任务状态与 Redis 键名
//! Job states and Redis key names

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 任务状态
/// Job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
  /// 任务准备好被处理
  /// Job is ready to be processed
  Waiting,
  /// 任务正在被处理
  /// Job is being processed
  Active,
  /// 任务在重试或延迟触发前等待
  /// Job is waiting out a retry backoff or a requested delay
  Delayed,
  /// 任务处理成功
  /// Job finished successfully
  Completed,
  /// 任务最终失败
  /// Job failed terminally
  Failed,
}

impl JobState {
  /// 将任务状态转换为字符串
  /// Convert job state to string
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Delayed => "delayed",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  /// 是否为终态
  /// Whether the state is terminal
  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  pub fn queue_key(&self, qname: &str) -> String {
    format!("{}{}", queue_key_prefix(qname), self.as_str())
  }
}

impl FromStr for JobState {
  type Err = ();

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "delayed" => Ok(Self::Delayed),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      _ => Err(()),
    }
  }
}

impl std::fmt::Display for JobState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

/// 生成队列键前缀: report:{qname}:
/// Generate queue key prefix: report:{qname}:
pub fn queue_key_prefix(qname: &str) -> String {
  format!("report:{{{}}}:", qname)
}

/// 生成任务键
/// Generate job key
pub fn job_key(qname: &str, id: &str) -> String {
  format!("{}t:{}", queue_key_prefix(qname), id)
}

pub fn waiting_key(qname: &str) -> String {
  JobState::Waiting.queue_key(qname)
}

pub fn active_key(qname: &str) -> String {
  JobState::Active.queue_key(qname)
}

pub fn delayed_key(qname: &str) -> String {
  JobState::Delayed.queue_key(qname)
}

pub fn completed_key(qname: &str) -> String {
  JobState::Completed.queue_key(qname)
}

pub fn failed_key(qname: &str) -> String {
  JobState::Failed.queue_key(qname)
}

/// 暂停标记键
/// Paused flag key
pub fn paused_key(qname: &str) -> String {
  format!("{}paused", queue_key_prefix(qname))
}

/// 入队序号键，用于同优先级内的 FIFO
/// Enqueue sequence key, used for FIFO within a priority
pub fn sequence_key(qname: &str) -> String {
  format!("{}seq", queue_key_prefix(qname))
}

/// 计划到任务的索引键
/// Schedule-to-jobs index key
pub fn schedule_jobs_key(qname: &str, schedule_id: &str) -> String {
  format!("{}schedule:{}", queue_key_prefix(qname), schedule_id)
}
