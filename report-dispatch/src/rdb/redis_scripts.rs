//! Redis Lua 脚本模块
//! Redis Lua script module
//!
//! 等待队列是一个 ZSET，分数为 `rank * 10^13 + seq`，其中 `rank = 100 - priority`，
//! `seq` 来自 INCR，因此优先级高的先出队，同优先级内先进先出
//!
//! The waiting queue is a ZSET scored `rank * 10^13 + seq`, where `rank = 100 - priority`
//! and `seq` comes from INCR, so higher priorities pop first and equal priorities stay FIFO

use crate::error::{Error, Result};
use phf::phf_map;
use redis::aio::MultiplexedConnection;
use redis::{RedisWrite, ToRedisArgs};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub enum RedisArg {
  Int(i64),
  Str(String),
}

impl ToRedisArgs for RedisArg {
  fn write_redis_args<W>(&self, out: &mut W)
  where
    W: ?Sized + RedisWrite,
  {
    match self {
      RedisArg::Int(i) => i.write_redis_args(out),
      RedisArg::Str(s) => s.write_redis_args(out),
    }
  }
}

impl From<&str> for RedisArg {
  fn from(value: &str) -> Self {
    RedisArg::Str(value.to_string())
  }
}

impl From<String> for RedisArg {
  fn from(value: String) -> Self {
    RedisArg::Str(value)
  }
}

impl From<i64> for RedisArg {
  fn from(value: i64) -> Self {
    RedisArg::Int(value)
  }
}

/// Redis Lua 脚本集合
/// Redis Lua scripts
pub mod scripts {
  /// 入队任务脚本
  /// Enqueue job script
  /// `KEYS[1]` -> report:{`<qname>`}:t:<job_id>
  /// `KEYS[2]` -> report:{`<qname>`}:waiting
  /// `KEYS[3]` -> report:{`<qname>`}:delayed
  /// `KEYS[4]` -> report:{`<qname>`}:seq
  /// `KEYS[5]` -> report:{`<qname>`}:schedule:<schedule_id>
  /// `ARGV[1]` -> job message JSON
  /// `ARGV[2]` -> job id
  /// `ARGV[3]` -> rank (100 - priority)
  /// `ARGV[4]` -> process_at in unix ms, 0 for immediately
  /// Returns 1 if enqueued, 0 if the job id already exists
  pub const ENQUEUE: &str = r#"
        if redis.call("EXISTS", KEYS[1]) == 1 then
            return 0
        end
        local process_at = tonumber(ARGV[4])
        if process_at > 0 then
            redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "delayed",
                       "rank", ARGV[3], "process_at", ARGV[4])
            redis.call("ZADD", KEYS[3], ARGV[4], ARGV[2])
        else
            redis.call("HSET", KEYS[1], "msg", ARGV[1], "state", "waiting", "rank", ARGV[3])
            local seq = redis.call("INCR", KEYS[4])
            local score = tonumber(ARGV[3]) * 10000000000000 + seq
            redis.call("ZADD", KEYS[2], string.format("%.0f", score), ARGV[2])
        end
        redis.call("SADD", KEYS[5], ARGV[2])
        return 1
    "#;

  /// 出队脚本
  /// Dequeue script
  /// `KEYS[1]` -> report:{`<qname>`}:paused
  /// `KEYS[2]` -> report:{`<qname>`}:waiting
  /// `KEYS[3]` -> report:{`<qname>`}:active
  /// `ARGV[1]` -> job key prefix
  /// `ARGV[2]` -> lease deadline in unix ms
  /// Returns the job message JSON, or nil when paused or empty
  pub const DEQUEUE: &str = r#"
        if redis.call("EXISTS", KEYS[1]) == 1 then
            return nil
        end
        local popped = redis.call("ZPOPMIN", KEYS[2])
        if #popped == 0 then
            return nil
        end
        local id = popped[1]
        local key = ARGV[1] .. id
        redis.call("ZADD", KEYS[3], ARGV[2], id)
        redis.call("HSET", key, "state", "active")
        return redis.call("HGET", key, "msg")
    "#;

  /// 结束任务脚本（completed 或 failed），并按数量裁剪保留列表。
  /// 终态任务不能再被取消，因此同时移出计划索引
  /// Finish job script (completed or failed), trimming the retention set by count.
  /// A finished job can no longer be cancelled, so it also leaves the schedule index
  /// `KEYS[1]` -> report:{`<qname>`}:active
  /// `KEYS[2]` -> report:{`<qname>`}:completed or :failed
  /// `KEYS[3]` -> report:{`<qname>`}:t:<job_id>
  /// `KEYS[4]` -> report:{`<qname>`}:schedule:<schedule_id>
  /// `ARGV[1]` -> job id
  /// `ARGV[2]` -> finished_at in unix ms
  /// `ARGV[3]` -> retention limit
  /// `ARGV[4]` -> job key prefix
  /// `ARGV[5]` -> state name
  /// `ARGV[6]` -> updated job message JSON
  /// Returns 1 on success, 0 if the job is not active
  pub const FINISH: &str = r#"
        if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        redis.call("SREM", KEYS[4], ARGV[1])
        redis.call("HSET", KEYS[3], "msg", ARGV[6], "state", ARGV[5], "finished_at", ARGV[2])
        redis.call("HDEL", KEYS[3], "process_at")
        redis.call("ZADD", KEYS[2], ARGV[2], ARGV[1])
        local excess = redis.call("ZCARD", KEYS[2]) - tonumber(ARGV[3])
        if excess > 0 then
            local old = redis.call("ZRANGE", KEYS[2], 0, excess - 1)
            for _, oid in ipairs(old) do
                redis.call("DEL", ARGV[4] .. oid)
            end
            redis.call("ZREMRANGEBYRANK", KEYS[2], 0, excess - 1)
        end
        return 1
    "#;

  /// 重试脚本
  /// Retry script
  /// `KEYS[1]` -> report:{`<qname>`}:active
  /// `KEYS[2]` -> report:{`<qname>`}:delayed
  /// `KEYS[3]` -> report:{`<qname>`}:t:<job_id>
  /// `ARGV[1]` -> job id
  /// `ARGV[2]` -> process_at in unix ms
  /// `ARGV[3]` -> updated job message JSON
  /// Returns 1 on success, 0 if the job is not active
  pub const RETRY: &str = r#"
        if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        redis.call("HSET", KEYS[3], "msg", ARGV[3], "state", "delayed", "process_at", ARGV[2])
        redis.call("ZADD", KEYS[2], ARGV[2], ARGV[1])
        return 1
    "#;

  /// 延长租约脚本
  /// Extend lease script
  /// `KEYS[1]` -> report:{`<qname>`}:active
  /// `ARGV[1]` -> job id
  /// `ARGV[2]` -> new lease deadline in unix ms
  /// Returns 1 if extended, 0 if the job is not active
  pub const EXTEND_LEASE: &str = r#"
        if not redis.call("ZSCORE", KEYS[1], ARGV[1]) then
            return 0
        end
        redis.call("ZADD", KEYS[1], ARGV[2], ARGV[1])
        return 1
    "#;

  /// 列出租约过期的 active 任务，丢弃已没有任务数据的条目
  /// List active jobs whose lease expired, dropping entries without job data
  /// `KEYS[1]` -> report:{`<qname>`}:active
  /// `ARGV[1]` -> now in unix ms (exclusive)
  /// `ARGV[2]` -> job key prefix
  /// Returns the job message JSONs, oldest lease first
  pub const LEASE_EXPIRED: &str = r#"
        local res = {}
        for _, id in ipairs(redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])) do
            local data = redis.call("HGET", ARGV[2] .. id, "msg")
            if data then
                table.insert(res, data)
            else
                redis.call("ZREM", KEYS[1], id)
            end
        end
        return res
    "#;

  /// 转发到期的延迟任务
  /// Forward due delayed jobs
  /// `KEYS[1]` -> report:{`<qname>`}:delayed
  /// `KEYS[2]` -> report:{`<qname>`}:waiting
  /// `KEYS[3]` -> report:{`<qname>`}:seq
  /// `ARGV[1]` -> now in unix ms
  /// `ARGV[2]` -> job key prefix
  /// `ARGV[3]` -> batch size
  /// Returns the number of jobs examined
  pub const FORWARD: &str = r#"
        local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
        for _, id in ipairs(ids) do
            local key = ARGV[2] .. id
            redis.call("ZREM", KEYS[1], id)
            local rank = redis.call("HGET", key, "rank")
            if rank then
                local seq = redis.call("INCR", KEYS[3])
                local score = tonumber(rank) * 10000000000000 + seq
                redis.call("ZADD", KEYS[2], string.format("%.0f", score), id)
                redis.call("HSET", key, "state", "waiting")
                redis.call("HDEL", key, "process_at")
            end
        end
        return #ids
    "#;

  /// 取消计划的 waiting/delayed 任务
  /// Cancel a schedule's waiting/delayed jobs
  /// `KEYS[1]` -> report:{`<qname>`}:schedule:<schedule_id>
  /// `KEYS[2]` -> report:{`<qname>`}:waiting
  /// `KEYS[3]` -> report:{`<qname>`}:delayed
  /// `ARGV[1]` -> job key prefix
  /// Returns the number of removed jobs
  pub const CANCEL: &str = r#"
        local removed = 0
        for _, id in ipairs(redis.call("SMEMBERS", KEYS[1])) do
            local key = ARGV[1] .. id
            if redis.call("ZREM", KEYS[2], id) + redis.call("ZREM", KEYS[3], id) > 0 then
                redis.call("DEL", key)
                redis.call("SREM", KEYS[1], id)
                removed = removed + 1
            elseif redis.call("EXISTS", key) == 0 then
                redis.call("SREM", KEYS[1], id)
            end
        end
        return removed
    "#;

  /// 删除在截止时间之前结束的任务
  /// Delete jobs that finished before the cutoff
  /// `KEYS[1]` -> report:{`<qname>`}:completed or :failed
  /// `ARGV[1]` -> cutoff in unix ms (exclusive)
  /// `ARGV[2]` -> job key prefix
  /// Returns the number of deleted jobs
  pub const DELETE_EXPIRED: &str = r#"
        local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
        for _, id in ipairs(ids) do
            redis.call("DEL", ARGV[2] .. id)
        end
        if #ids > 0 then
            redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. ARGV[1])
        end
        return #ids
    "#;
}

/// Redis 脚本管理器
/// Redis script manager
#[derive(Debug, Default)]
pub struct ScriptManager {
  /// 脚本SHA缓存
  /// Script SHA cache
  script_sha1: HashMap<&'static str, String>,
}

impl ScriptManager {
  /// 预加载所有脚本
  /// Preload every script
  pub async fn load_scripts(&mut self, conn: &mut MultiplexedConnection) -> Result<()> {
    for (name, script) in ALL_SCRIPT.entries() {
      let sha = Self::load_script(conn, script).await?;
      self.script_sha1.insert(name, sha);
    }
    Ok(())
  }

  async fn load_script(conn: &mut MultiplexedConnection, script: &str) -> Result<String> {
    let sha: String = redis::cmd("SCRIPT")
      .arg("LOAD")
      .arg(script)
      .query_async(conn)
      .await?;
    Ok(sha)
  }

  /// 获取脚本SHA
  /// Get a script's SHA
  pub fn get_script_sha(&self, name: &str) -> Option<&String> {
    self.script_sha1.get(name)
  }

  /// 执行脚本，脚本被清理时回退到 EVAL
  /// Run a script, falling back to EVAL when the script cache was flushed
  pub async fn eval_script<T>(
    &self,
    conn: &mut MultiplexedConnection,
    script_name: &str,
    keys: &[String],
    args: &[RedisArg],
  ) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let script = ALL_SCRIPT
      .get(script_name)
      .ok_or_else(|| Error::other(format!("Unknown script: {script_name}")))?;

    if let Some(sha) = self.get_script_sha(script_name) {
      match redis::cmd("EVALSHA")
        .arg(sha)
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async::<T>(conn)
        .await
      {
        Ok(result) => return Ok(result),
        Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
          tracing::debug!("Script {} missing from cache, using EVAL", script_name);
        }
        Err(e) => return Err(e.into()),
      }
    }

    let result = redis::cmd("EVAL")
      .arg(*script)
      .arg(keys.len())
      .arg(keys)
      .arg(args)
      .query_async::<T>(conn)
      .await?;
    Ok(result)
  }
}

static ALL_SCRIPT: phf::Map<&'static str, &'static str> = phf_map! {
    "enqueue" => scripts::ENQUEUE,
    "dequeue" => scripts::DEQUEUE,
    "finish" => scripts::FINISH,
    "retry" => scripts::RETRY,
    "extend_lease" => scripts::EXTEND_LEASE,
    "lease_expired" => scripts::LEASE_EXPIRED,
    "forward" => scripts::FORWARD,
    "cancel" => scripts::CANCEL,
    "delete_expired" => scripts::DELETE_EXPIRED,
};
