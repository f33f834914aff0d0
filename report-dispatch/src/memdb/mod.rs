//! 内存存储后端
//! In-memory storage backends
//!
//! 不依赖任何外部服务，适用于测试与单进程部署
//! No external service required, suited to tests and single-process deployments

mod broker;
pub mod memory_broker;
pub mod schedule_store;

pub use memory_broker::MemoryBroker;
pub use schedule_store::MemoryScheduleRepository;
