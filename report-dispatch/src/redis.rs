//! Redis 配置和连接管理模块
//! Redis configuration and connection management module

use crate::error::Result;
use redis::{Client, ConnectionInfo, IntoConnectionInfo};

/// Redis 连接类型
/// Redis connection types
#[derive(Debug, Clone)]
pub enum RedisConnectionConfig {
  /// 单机连接
  /// Standalone connection
  Single(ConnectionInfo),
}

impl RedisConnectionConfig {
  /// 创建单机连接
  /// Create a standalone connection
  pub fn single<T: IntoConnectionInfo>(connection_info: T) -> Result<Self> {
    Ok(Self::Single(connection_info.into_connection_info()?))
  }

  /// 打开客户端
  /// Open a client
  pub fn open(&self) -> Result<Client> {
    match self {
      Self::Single(info) => Ok(Client::open(info.clone())?),
    }
  }
}
