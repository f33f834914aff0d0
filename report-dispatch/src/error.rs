//! 错误处理模块
//! Error handling module
//!
//! 定义了报表调度引擎中使用的各种错误类型，以及决定是否重试的分类
//! Defines the error types used by the report dispatch engine and the classification that drives retries

use thiserror::Error;

/// 报表调度引擎的结果类型
/// Result type for the report dispatch engine
pub type Result<T> = std::result::Result<T, Error>;

/// 报表调度错误类型
/// Report dispatch error type
#[derive(Error, Debug)]
pub enum Error {
  /// 暂时性错误（超时、协作服务暂不可用）
  /// Transient error (timeouts, collaborator temporarily unavailable)
  #[error("Transient error: {message}")]
  Transient { message: String },

  /// 校验错误（无效的计划参数、不支持的格式）
  /// Validation error (bad schedule parameters, unsupported format)
  #[error("Validation error: {message}")]
  Validation { message: String },

  /// 单个收件人投递失败
  /// Single recipient delivery failure
  #[error("Delivery to {recipient} failed: {message}")]
  Delivery { recipient: String, message: String },

  /// 基础设施错误（队列存储不可达）
  /// Infrastructure error (queue backing store unreachable)
  #[error("Infrastructure error: {message}")]
  Infrastructure { message: String },

  #[cfg(feature = "redis")]
  /// Redis 连接错误
  /// Redis connection error
  #[error("Redis error: {0}")]
  Redis(#[from] redis::RedisError),

  /// 序列化错误
  /// Serialization error
  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// 任务 ID 冲突错误
  /// Job ID conflict error
  #[error("Job ID conflicts with another job")]
  JobIdConflict,

  /// 任务未找到错误
  /// Job not found error
  #[error("Job not found: {id}")]
  JobNotFound { id: String },

  /// 计划未找到错误
  /// Schedule not found error
  #[error("Schedule not found: {id}")]
  ScheduleNotFound { id: String },

  /// 配置错误
  /// Configuration error
  #[error("Configuration error: {message}")]
  Config { message: String },

  /// 引擎已在运行
  /// Engine is already running
  #[error("Engine is already running")]
  EngineRunning,

  /// 引擎已关闭
  /// Engine closed
  #[error("Engine closed")]
  EngineClosed,

  /// 超时错误
  /// Timeout error
  #[error("Operation timeout")]
  Timeout,

  /// 其他错误
  /// Other error
  #[error("Other error: {message}")]
  Other { message: String },
}

impl Error {
  /// 创建暂时性错误
  /// Create a transient error
  pub fn transient<S: Into<String>>(message: S) -> Self {
    Self::Transient {
      message: message.into(),
    }
  }

  /// 创建校验错误
  /// Create a validation error
  pub fn validation<S: Into<String>>(message: S) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  /// 创建投递错误
  /// Create a delivery error
  pub fn delivery<R: Into<String>, S: Into<String>>(recipient: R, message: S) -> Self {
    Self::Delivery {
      recipient: recipient.into(),
      message: message.into(),
    }
  }

  /// 创建基础设施错误
  /// Create an infrastructure error
  pub fn infrastructure<S: Into<String>>(message: S) -> Self {
    Self::Infrastructure {
      message: message.into(),
    }
  }

  /// 创建配置错误
  /// Create a configuration error
  pub fn config<S: Into<String>>(message: S) -> Self {
    Self::Config {
      message: message.into(),
    }
  }

  /// 创建其他错误
  /// Create another type of error
  pub fn other<S: Into<String>>(message: S) -> Self {
    Self::Other {
      message: message.into(),
    }
  }

  /// 检查是否为重试错误
  /// Check if the error is retriable
  pub fn is_retriable(&self) -> bool {
    match self {
      Error::Transient { .. } | Error::Infrastructure { .. } | Error::Timeout => true,
      #[cfg(feature = "redis")]
      Error::Redis(_) => true,
      Error::Validation { .. }
      | Error::Delivery { .. }
      | Error::Serialization(_)
      | Error::JobIdConflict
      | Error::JobNotFound { .. }
      | Error::ScheduleNotFound { .. }
      | Error::Config { .. }
      | Error::EngineRunning
      | Error::EngineClosed
      | Error::Other { .. } => false,
    }
  }

  /// 检查是否为致命错误
  /// Check if the error is fatal
  pub fn is_fatal(&self) -> bool {
    !self.is_retriable()
  }
}
