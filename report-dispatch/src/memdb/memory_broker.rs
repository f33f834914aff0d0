//! 内存经纪人实现
//! Memory broker implementation
//!
//! 使用内存数据结构实现任务存储和管理，不依赖任何外部服务
//! Implements job storage and management using in-memory data structures without any external service dependencies

use crate::base::constants::{
  DEFAULT_COMPLETED_RETENTION, DEFAULT_FAILED_RETENTION, DEFAULT_QUEUE_NAME,
};
use crate::base::keys::JobState;
use crate::job::{JobInfo, JobMessage};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// 内存中的任务数据
/// In-memory job data
#[derive(Clone, Debug)]
pub struct JobData {
  /// 任务消息
  /// Job message
  pub message: JobMessage,
  /// 当前状态
  /// Current state
  pub state: JobState,
  /// delayed 任务的到期时间
  /// Due time of a delayed job
  pub process_at: Option<DateTime<Utc>>,
  /// 结束时间
  /// Finish time
  pub finished_at: Option<DateTime<Utc>>,
}

impl JobData {
  pub fn info(&self) -> JobInfo {
    JobInfo::from_message(&self.message, self.state, self.process_at, self.finished_at)
  }
}

/// 队列数据结构
/// Queue data structure
#[derive(Default)]
pub struct QueueData {
  /// 等待任务，键为 (-priority, 入队序号)，保证高优先级在前、同优先级 FIFO
  /// Waiting jobs keyed by (-priority, enqueue sequence): higher priority first, FIFO within a priority
  pub waiting: BTreeMap<(i32, u64), String>,
  /// 活跃任务及其租约到期时间
  /// Active jobs and their lease deadlines
  pub active: HashMap<String, DateTime<Utc>>,
  /// 延迟任务，键为 (到期毫秒, 序号)
  /// Delayed jobs keyed by (due millis, sequence)
  pub delayed: BTreeMap<(i64, u64), String>,
  /// 已完成任务，最旧的在前
  /// Completed jobs, oldest first
  pub completed: VecDeque<String>,
  /// 失败任务，最旧的在前
  /// Failed jobs, oldest first
  pub failed: VecDeque<String>,
  /// 是否暂停
  /// Whether paused
  pub paused: bool,
  sequence: u64,
}

impl QueueData {
  /// 下一个入队序号
  /// Next enqueue sequence
  pub fn next_sequence(&mut self) -> u64 {
    self.sequence += 1;
    self.sequence
  }

  pub fn push_waiting(&mut self, id: &str, priority: i32) {
    let seq = self.next_sequence();
    self.waiting.insert((-priority, seq), id.to_string());
  }

  pub fn push_delayed(&mut self, id: &str, process_at: DateTime<Utc>) {
    let seq = self.next_sequence();
    self
      .delayed
      .insert((process_at.timestamp_millis(), seq), id.to_string());
  }
}

/// 内存存储
/// Memory storage
#[derive(Default)]
pub struct MemoryStorage {
  pub queue: QueueData,
  /// 任务数据 - key: job id
  /// Job data - key: job id
  pub jobs: HashMap<String, JobData>,
}

impl MemoryStorage {
  /// 将终态任务追加到保留列表，超出上限时淘汰最旧的
  /// Append a finished job to its retention list, evicting the oldest past the limit
  pub(crate) fn retain_finished(&mut self, state: JobState, id: &str, limit: usize) {
    let list = match state {
      JobState::Completed => &mut self.queue.completed,
      JobState::Failed => &mut self.queue.failed,
      _ => return,
    };
    list.push_back(id.to_string());
    let mut evicted = Vec::new();
    while list.len() > limit {
      if let Some(old) = list.pop_front() {
        evicted.push(old);
      }
    }
    for old in evicted {
      self.jobs.remove(&old);
    }
  }
}

/// 内存经纪人实现
/// Memory broker implementation
pub struct MemoryBroker {
  /// 内存存储
  /// Memory storage
  pub(crate) storage: Arc<RwLock<MemoryStorage>>,
  pub(crate) queue: String,
  pub(crate) completed_retention: usize,
  pub(crate) failed_retention: usize,
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryBroker {
  /// 创建新的内存经纪人实例
  /// Create a new memory broker instance
  pub fn new() -> Self {
    Self {
      storage: Arc::new(RwLock::new(MemoryStorage::default())),
      queue: DEFAULT_QUEUE_NAME.to_string(),
      completed_retention: DEFAULT_COMPLETED_RETENTION,
      failed_retention: DEFAULT_FAILED_RETENTION,
    }
  }

  /// 使用指定队列名创建
  /// Create with a specific queue name
  pub fn with_queue(queue: &str) -> Self {
    Self {
      queue: queue.to_string(),
      ..Self::new()
    }
  }

  /// 设置已完成与失败任务的保留数量
  /// Set how many completed and failed jobs are retained
  pub fn with_retention(mut self, completed: usize, failed: usize) -> Self {
    self.completed_retention = completed.max(1);
    self.failed_retention = failed.max(1);
    self
  }

  /// 获取存储的引用
  /// Get storage reference
  pub fn storage(&self) -> &Arc<RwLock<MemoryStorage>> {
    &self.storage
  }
}
