//! Redis 经纪人模块
//! Redis broker module
//!
//! 每个状态迁移都是一个 Lua 脚本，因此对共享同一 Redis 的多个进程也是原子的
//! Every state transition is a single Lua script, so it is atomic across processes sharing one Redis

pub mod redis_broker;
pub mod redis_scripts;

pub use redis_broker::RedisBroker;
