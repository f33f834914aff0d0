//! 配置模块
//! Configuration module
//!
//! 定义了调度引擎的配置选项
//! Defines configuration options for the dispatch engine

use crate::base::constants::{
  DEFAULT_COLLABORATOR_TIMEOUT, DEFAULT_COMPLETED_MAX_AGE, DEFAULT_CONCURRENCY,
  DEFAULT_FAILED_MAX_AGE, DEFAULT_FORWARD_INTERVAL, DEFAULT_JANITOR_INTERVAL,
  DEFAULT_JOB_CHECK_INTERVAL, DEFAULT_LEASE_DURATION, DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL,
  DEFAULT_QUEUE_NAME, DEFAULT_RECOVER_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::job::RetryPolicy;
use std::time::Duration;

/// 引擎配置
/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// 并发工作者数量
  /// Number of concurrent workers
  pub concurrency: usize,
  /// 每个任务最多执行次数（含首次）
  /// Maximum executions per job, including the first
  pub max_attempts: u32,
  /// 重试退避策略
  /// Retry backoff policy
  pub retry_policy: RetryPolicy,
  /// 到期检测轮询间隔
  /// Due detection poll interval
  pub poll_interval: Duration,
  /// 空闲时检查新任务的间隔
  /// Interval between checks for new jobs when idle
  pub job_check_interval: Duration,
  /// 延迟任务转发间隔
  /// Delayed job forwarding interval
  pub forward_interval: Duration,
  /// 清理任务间隔
  /// Janitor interval
  pub janitor_interval: Duration,
  /// 已完成任务的最长保留时间
  /// Maximum age of retained completed jobs
  pub completed_max_age: Duration,
  /// 失败任务的最长保留时间
  /// Maximum age of retained failed jobs
  pub failed_max_age: Duration,
  /// 单次协作服务调用超时
  /// Timeout of a single collaborator call
  pub collaborator_timeout: Duration,
  /// 关闭超时时间
  /// Shutdown timeout
  pub shutdown_timeout: Duration,
  /// 任务租约时长，工作者执行期间每三分之一续约一次
  /// Job lease duration; a running worker renews it every third of this
  pub lease_duration: Duration,
  /// 租约过期任务的恢复间隔
  /// Interval between scans for lease-expired jobs
  pub recover_interval: Duration,
  /// 队列名称，必须与 Broker 的队列一致
  /// Queue name, must match the broker's queue
  pub queue_name: String,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      concurrency: DEFAULT_CONCURRENCY,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
      retry_policy: RetryPolicy::default(),
      poll_interval: DEFAULT_POLL_INTERVAL,
      job_check_interval: DEFAULT_JOB_CHECK_INTERVAL,
      forward_interval: DEFAULT_FORWARD_INTERVAL,
      janitor_interval: DEFAULT_JANITOR_INTERVAL,
      completed_max_age: DEFAULT_COMPLETED_MAX_AGE,
      failed_max_age: DEFAULT_FAILED_MAX_AGE,
      collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
      shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
      lease_duration: DEFAULT_LEASE_DURATION,
      recover_interval: DEFAULT_RECOVER_INTERVAL,
      queue_name: DEFAULT_QUEUE_NAME.to_string(),
    }
  }
}

impl EngineConfig {
  /// 创建新的引擎配置
  /// Create a new engine configuration
  pub fn new() -> Self {
    Self::default()
  }

  /// 设置并发数
  /// Set the number of concurrent workers
  pub fn concurrency(mut self, concurrency: usize) -> Self {
    self.concurrency = concurrency.max(1);
    self
  }

  /// 设置最大执行次数
  /// Set the attempt ceiling
  pub fn max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  /// 设置重试策略
  /// Set the retry policy
  pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.retry_policy = policy;
    self
  }

  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.poll_interval = interval;
    self
  }

  pub fn job_check_interval(mut self, interval: Duration) -> Self {
    self.job_check_interval = interval;
    self
  }

  pub fn forward_interval(mut self, interval: Duration) -> Self {
    self.forward_interval = interval;
    self
  }

  pub fn janitor_interval(mut self, interval: Duration) -> Self {
    self.janitor_interval = interval;
    self
  }

  /// 设置终态任务的最长保留时间
  /// Set the maximum age of finished jobs
  pub fn retention_age(mut self, completed: Duration, failed: Duration) -> Self {
    self.completed_max_age = completed;
    self.failed_max_age = failed;
    self
  }

  pub fn collaborator_timeout(mut self, timeout: Duration) -> Self {
    self.collaborator_timeout = timeout;
    self
  }

  /// 设置关闭超时时间
  /// Set the shutdown timeout
  pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
    self.shutdown_timeout = timeout;
    self
  }

  pub fn lease_duration(mut self, lease: Duration) -> Self {
    self.lease_duration = lease;
    self
  }

  pub fn recover_interval(mut self, interval: Duration) -> Self {
    self.recover_interval = interval;
    self
  }

  pub fn queue_name<S: Into<String>>(mut self, name: S) -> Self {
    self.queue_name = name.into();
    self
  }

  /// 验证配置
  /// Validate the configuration
  pub fn validate(&self) -> Result<()> {
    if self.concurrency == 0 {
      return Err(Error::config("Concurrency must be greater than 0"));
    }
    if self.max_attempts == 0 {
      return Err(Error::config("Max attempts must be greater than 0"));
    }
    if self.queue_name.trim().is_empty() {
      return Err(Error::config("Queue name must not be empty"));
    }
    let intervals = [
      ("poll_interval", self.poll_interval),
      ("job_check_interval", self.job_check_interval),
      ("forward_interval", self.forward_interval),
      ("janitor_interval", self.janitor_interval),
      ("recover_interval", self.recover_interval),
      ("lease_duration", self.lease_duration),
      ("collaborator_timeout", self.collaborator_timeout),
    ];
    for (name, value) in intervals {
      if value.is_zero() {
        return Err(Error::config(format!("{name} must be greater than 0")));
      }
    }
    if self.completed_max_age.is_zero() || self.failed_max_age.is_zero() {
      return Err(Error::config("Retention age must be greater than 0"));
    }
    Ok(())
  }
}
