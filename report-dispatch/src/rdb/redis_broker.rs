//! Redis 经纪人实现
//! Redis broker implementation
//!
//! 任务以 JSON 形式保存在 `report:{<queue>}:t:<id>` 哈希中，各状态用 ZSET 索引；
//! active 的分数是租约到期时间
//! Jobs are stored as JSON in `report:{<queue>}:t:<id>` hashes and indexed per state with ZSETs;
//! the active set is scored by lease deadline

use crate::base::constants::{
  DEFAULT_COMPLETED_RETENTION, DEFAULT_FAILED_RETENTION, DEFAULT_QUEUE_NAME,
};
use crate::base::keys::{self, JobState};
use crate::base::{Broker, QueueStats};
use crate::error::{Error, Result};
use crate::job::{JobInfo, JobMessage};
use crate::rdb::redis_scripts::{RedisArg, ScriptManager};
use crate::redis::RedisConnectionConfig;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;

/// 一次转发处理的最大任务数
/// Maximum number of jobs handled per forwarding batch
const FORWARD_BATCH_SIZE: i64 = 100;

/// Redis 经纪人实现
/// Redis broker implementation
pub struct RedisBroker {
  conn: MultiplexedConnection,
  queue: String,
  completed_retention: usize,
  failed_retention: usize,
  pub(crate) script_manager: ScriptManager,
}

impl RedisBroker {
  /// 连接 Redis 并预加载脚本
  /// Connect to Redis and preload scripts
  pub async fn new(config: RedisConnectionConfig) -> Result<Self> {
    Self::with_queue(config, DEFAULT_QUEUE_NAME).await
  }

  /// 使用指定队列名创建
  /// Create with a specific queue name
  pub async fn with_queue(config: RedisConnectionConfig, queue: &str) -> Result<Self> {
    let client = config.open()?;
    let conn = client.get_multiplexed_async_connection().await?;
    let mut broker = Self {
      conn,
      queue: queue.to_string(),
      completed_retention: DEFAULT_COMPLETED_RETENTION,
      failed_retention: DEFAULT_FAILED_RETENTION,
      script_manager: ScriptManager::default(),
    };
    broker.init_scripts().await?;
    Ok(broker)
  }

  /// 设置已完成与失败任务的保留数量
  /// Set how many completed and failed jobs are retained
  pub fn with_retention(mut self, completed: usize, failed: usize) -> Self {
    self.completed_retention = completed.max(1);
    self.failed_retention = failed.max(1);
    self
  }

  /// 初始化脚本
  /// Initialize scripts
  pub async fn init_scripts(&mut self) -> Result<()> {
    let mut conn = self.conn.clone();
    self.script_manager.load_scripts(&mut conn).await
  }

  fn connection(&self) -> MultiplexedConnection {
    self.conn.clone()
  }

  fn job_prefix(&self) -> String {
    format!("{}t:", keys::queue_key_prefix(&self.queue))
  }

  async fn finish(
    &self,
    msg: &JobMessage,
    state: JobState,
    limit: usize,
    now: DateTime<Utc>,
  ) -> Result<()> {
    let keys = vec![
      keys::active_key(&self.queue),
      state.queue_key(&self.queue),
      keys::job_key(&self.queue, &msg.id),
      keys::schedule_jobs_key(&self.queue, &msg.schedule_id),
    ];
    let args = vec![
      RedisArg::from(msg.id.as_str()),
      RedisArg::Int(now.timestamp_millis()),
      RedisArg::Int(i64::try_from(limit).unwrap_or(i64::MAX)),
      RedisArg::from(self.job_prefix()),
      RedisArg::from(state.as_str()),
      RedisArg::from(msg.encode()?),
    ];
    let mut conn = self.connection();
    let ok: i64 = self
      .script_manager
      .eval_script(&mut conn, "finish", &keys, &args)
      .await?;
    if ok == 0 {
      return Err(Error::JobNotFound { id: msg.id.clone() });
    }
    Ok(())
  }

  /// 带上新的尝试次数和错误信息的消息
  /// The message with its attempt and error updated
  fn failed_message(msg: &JobMessage, error_msg: &str) -> JobMessage {
    let mut updated = msg.clone();
    updated.attempt = msg.attempt + 1;
    updated.last_error = Some(error_msg.to_string());
    updated
  }
}

/// 等待队列的排序等级，越小越先出队
/// Waiting-queue rank, lower pops first
fn rank(priority: i32) -> i64 {
  100 - i64::from(priority.clamp(0, 100))
}

fn parse_millis(value: Option<&String>) -> Option<DateTime<Utc>> {
  value
    .and_then(|v| v.parse::<i64>().ok())
    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

fn job_info_from_hash(fields: &HashMap<String, String>) -> Result<Option<JobInfo>> {
  let Some(data) = fields.get("msg") else {
    return Ok(None);
  };
  let msg = JobMessage::decode(data)?;
  let state = fields
    .get("state")
    .and_then(|s| s.parse::<JobState>().ok())
    .ok_or_else(|| Error::other(format!("job {} has no valid state", msg.id)))?;
  Ok(Some(JobInfo::from_message(
    &msg,
    state,
    parse_millis(fields.get("process_at")),
    parse_millis(fields.get("finished_at")),
  )))
}

#[async_trait]
impl Broker for RedisBroker {
  async fn ping(&self) -> Result<()> {
    let mut conn = self.connection();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    Ok(())
  }

  async fn enqueue(&self, msg: &JobMessage, process_at: Option<DateTime<Utc>>) -> Result<JobInfo> {
    let delayed_until = process_at.filter(|at| *at > msg.enqueued_at);
    let keys = vec![
      keys::job_key(&self.queue, &msg.id),
      keys::waiting_key(&self.queue),
      keys::delayed_key(&self.queue),
      keys::sequence_key(&self.queue),
      keys::schedule_jobs_key(&self.queue, &msg.schedule_id),
    ];
    let args = vec![
      RedisArg::from(msg.encode()?),
      RedisArg::from(msg.id.as_str()),
      RedisArg::Int(rank(msg.priority)),
      RedisArg::Int(delayed_until.map(|at| at.timestamp_millis()).unwrap_or(0)),
    ];
    let mut conn = self.connection();
    let created: i64 = self
      .script_manager
      .eval_script(&mut conn, "enqueue", &keys, &args)
      .await?;
    if created == 0 {
      return Err(Error::JobIdConflict);
    }
    let state = if delayed_until.is_some() {
      JobState::Delayed
    } else {
      JobState::Waiting
    };
    Ok(JobInfo::from_message(msg, state, delayed_until, None))
  }

  fn queue_name(&self) -> &str {
    &self.queue
  }

  async fn dequeue(&self, lease_until: DateTime<Utc>) -> Result<Option<JobMessage>> {
    let keys = vec![
      keys::paused_key(&self.queue),
      keys::waiting_key(&self.queue),
      keys::active_key(&self.queue),
    ];
    let args = vec![
      RedisArg::from(self.job_prefix()),
      RedisArg::Int(lease_until.timestamp_millis()),
    ];
    let mut conn = self.connection();
    let data: Option<String> = self
      .script_manager
      .eval_script(&mut conn, "dequeue", &keys, &args)
      .await?;
    data.map(|d| JobMessage::decode(&d)).transpose()
  }

  async fn extend_lease(&self, id: &str, lease_until: DateTime<Utc>) -> Result<bool> {
    let keys = vec![keys::active_key(&self.queue)];
    let args = vec![
      RedisArg::from(id),
      RedisArg::Int(lease_until.timestamp_millis()),
    ];
    let mut conn = self.connection();
    let extended: i64 = self
      .script_manager
      .eval_script(&mut conn, "extend_lease", &keys, &args)
      .await?;
    Ok(extended == 1)
  }

  async fn list_lease_expired(&self, now: DateTime<Utc>) -> Result<Vec<JobMessage>> {
    let keys = vec![keys::active_key(&self.queue)];
    let args = vec![
      RedisArg::Int(now.timestamp_millis()),
      RedisArg::from(self.job_prefix()),
    ];
    let mut conn = self.connection();
    let data: Vec<String> = self
      .script_manager
      .eval_script(&mut conn, "lease_expired", &keys, &args)
      .await?;
    data.iter().map(|d| JobMessage::decode(d)).collect()
  }

  async fn done(&self, msg: &JobMessage, now: DateTime<Utc>) -> Result<()> {
    self
      .finish(msg, JobState::Completed, self.completed_retention, now)
      .await
  }

  async fn retry(&self, msg: &JobMessage, process_at: DateTime<Utc>, error_msg: &str) -> Result<()> {
    let updated = Self::failed_message(msg, error_msg);
    let keys = vec![
      keys::active_key(&self.queue),
      keys::delayed_key(&self.queue),
      keys::job_key(&self.queue, &msg.id),
    ];
    let args = vec![
      RedisArg::from(msg.id.as_str()),
      RedisArg::Int(process_at.timestamp_millis()),
      RedisArg::from(updated.encode()?),
    ];
    let mut conn = self.connection();
    let ok: i64 = self
      .script_manager
      .eval_script(&mut conn, "retry", &keys, &args)
      .await?;
    if ok == 0 {
      return Err(Error::JobNotFound { id: msg.id.clone() });
    }
    Ok(())
  }

  async fn fail(&self, msg: &JobMessage, error_msg: &str, now: DateTime<Utc>) -> Result<()> {
    let updated = Self::failed_message(msg, error_msg);
    self
      .finish(&updated, JobState::Failed, self.failed_retention, now)
      .await
  }

  async fn forward_if_ready(&self, now: DateTime<Utc>) -> Result<usize> {
    let keys = vec![
      keys::delayed_key(&self.queue),
      keys::waiting_key(&self.queue),
      keys::sequence_key(&self.queue),
    ];
    let args = vec![
      RedisArg::Int(now.timestamp_millis()),
      RedisArg::from(self.job_prefix()),
      RedisArg::Int(FORWARD_BATCH_SIZE),
    ];
    let mut conn = self.connection();
    let mut total = 0usize;
    loop {
      let moved: i64 = self
        .script_manager
        .eval_script(&mut conn, "forward", &keys, &args)
        .await?;
      total += usize::try_from(moved).unwrap_or(0);
      if moved < FORWARD_BATCH_SIZE {
        break;
      }
    }
    Ok(total)
  }

  async fn cancel_for_schedule(&self, schedule_id: &str) -> Result<usize> {
    let keys = vec![
      keys::schedule_jobs_key(&self.queue, schedule_id),
      keys::waiting_key(&self.queue),
      keys::delayed_key(&self.queue),
    ];
    let args = vec![RedisArg::from(self.job_prefix())];
    let mut conn = self.connection();
    let removed: i64 = self
      .script_manager
      .eval_script(&mut conn, "cancel", &keys, &args)
      .await?;
    Ok(usize::try_from(removed).unwrap_or(0))
  }

  async fn stats(&self) -> Result<QueueStats> {
    let mut conn = self.connection();
    let (waiting, active, delayed, completed, failed, paused): (
      usize,
      usize,
      usize,
      usize,
      usize,
      bool,
    ) = redis::pipe()
      .atomic()
      .zcard(keys::waiting_key(&self.queue))
      .zcard(keys::active_key(&self.queue))
      .zcard(keys::delayed_key(&self.queue))
      .zcard(keys::completed_key(&self.queue))
      .zcard(keys::failed_key(&self.queue))
      .exists(keys::paused_key(&self.queue))
      .query_async(&mut conn)
      .await?;
    Ok(QueueStats {
      waiting,
      active,
      delayed,
      completed,
      failed,
      paused,
    })
  }

  async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<JobInfo>> {
    let mut conn = self.connection();
    let key = state.queue_key(&self.queue);
    let ids: Vec<String> = match state {
      JobState::Waiting | JobState::Active | JobState::Delayed => {
        conn.zrange(&key, 0, -1).await?
      }
      JobState::Completed | JobState::Failed => {
        let stop = isize::try_from(limit).unwrap_or(isize::MAX).max(1) - 1;
        conn.zrevrange(&key, 0, stop).await?
      }
    };

    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
      let fields: HashMap<String, String> = conn.hgetall(keys::job_key(&self.queue, &id)).await?;
      if let Some(info) = job_info_from_hash(&fields)? {
        jobs.push(info);
      }
    }
    if !state.is_terminal() {
      jobs.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
    }
    jobs.truncate(limit);
    Ok(jobs)
  }

  async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
    let mut conn = self.connection();
    let fields: HashMap<String, String> = conn.hgetall(keys::job_key(&self.queue, id)).await?;
    job_info_from_hash(&fields)
  }

  async fn pause(&self) -> Result<()> {
    let mut conn = self.connection();
    let _: () = conn.set(keys::paused_key(&self.queue), Utc::now().timestamp()).await?;
    Ok(())
  }

  async fn unpause(&self) -> Result<()> {
    let mut conn = self.connection();
    let _: () = conn.del(keys::paused_key(&self.queue)).await?;
    Ok(())
  }

  async fn delete_expired(&self, state: JobState, older_than: DateTime<Utc>) -> Result<usize> {
    if !state.is_terminal() {
      return Err(Error::other(format!(
        "only finished jobs can expire, got {state}"
      )));
    }
    let keys = vec![state.queue_key(&self.queue)];
    let args = vec![
      RedisArg::Int(older_than.timestamp_millis()),
      RedisArg::from(self.job_prefix()),
    ];
    let mut conn = self.connection();
    let deleted: i64 = self
      .script_manager
      .eval_script(&mut conn, "delete_expired", &keys, &args)
      .await?;
    Ok(usize::try_from(deleted).unwrap_or(0))
  }
}
