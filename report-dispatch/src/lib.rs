//! # Report Dispatch
//!
//! 计划报表调度引擎
//! Scheduled report dispatch engine
//!
//! 后台进程定期发现到期的报表计划，按优先级入队任务，调用外部的分析、渲染和邮件服务执行任务，
//! 并记录失败历史，在计划连续失败过多时自动停用它。
//! A background process that periodically finds due report schedules, enqueues prioritized jobs,
//! runs them against external analytics, rendering and email services, and records failure
//! history so a misbehaving schedule is disabled automatically.
//!
//! ## 特性
//! ## Features
//!
//! - 每次到期触发只入队一次
//!   - Each due occurrence is enqueued exactly once
//! - 按报表类型的优先级队列，同优先级内先进先出
//!   - Priority queue by report type, FIFO within a priority
//! - 暂时性错误的指数退避重试
//!   - Exponential backoff retries for transient errors
//! - 单个收件人投递失败不影响其他收件人
//!   - One recipient's delivery failure never affects the others
//! - 连续失败达到上限时停用计划并通知所有者
//!   - Disables a schedule and notifies its owner after too many consecutive failures
//! - 工作者消失后，租约过期的任务会被恢复并重试
//!   - Jobs whose worker disappeared are recovered and retried once their lease expires
//! - 内存和 Redis 两种队列后端
//!   - In-memory and Redis queue backends
//!
//! ## 快速开始
//! ## Quick Start
//!
//! ```rust,no_run
//! use report_dispatch::engine::Engine;
//! use report_dispatch::memdb::MemoryScheduleRepository;
//! # use report_dispatch::collaborators::*;
//! # use std::sync::Arc;
//! # async fn example(
//! #   analytics: Arc<dyn AnalyticsProvider>,
//! #   renderer: Arc<dyn ReportRenderer>,
//! #   email: Arc<dyn EmailSender>,
//! #   notifier: Arc<dyn OwnerNotifier>,
//! # ) -> report_dispatch::error::Result<()> {
//! let mut engine = Engine::builder()
//!   .repository(Arc::new(MemoryScheduleRepository::new()))
//!   .analytics(analytics)
//!   .renderer(renderer)
//!   .email(email)
//!   .notifier(notifier)
//!   .build()?;
//!
//! // 运行直到 Ctrl-C
//! // Run until Ctrl-C
//! engine.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod base;
pub mod clock;
pub mod collaborators;
pub mod components;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod inspector;
pub mod job;
pub mod logging;
pub mod memdb;
#[cfg(feature = "redis")]
pub mod rdb;
#[cfg(feature = "redis")]
pub mod redis;
pub mod schedule;
pub mod tracker;
