//! Lifecycle 模块
//! Lifecycle module
//!
//! 提供通用的组件生命周期管理 trait
//! Provides a common trait for component lifecycle management
//!
//! 此模块定义了统一的生命周期接口，用于管理各种后台组件（如 Detector、Forwarder 等）
//! This module defines a unified lifecycle interface for managing background components
//! (such as Detector, Forwarder, etc.)

use std::sync::Arc;
use tokio::task::JoinHandle;

pub mod detector;
pub mod forwarder;
pub mod janitor;
pub mod processor;
pub mod recoverer;

/// Lifecycle trait - 组件生命周期管理接口
/// Lifecycle trait - Component lifecycle management interface
///
/// # 实现者 / Implementors
///
/// - [`Detector`](detector::Detector) - 发现到期计划并入队任务
/// - [`Forwarder`](forwarder::Forwarder) - 转发退避结束的延迟任务
/// - [`Janitor`](janitor::Janitor) - 清理过期的已完成和失败任务
/// - [`Recoverer`](recoverer::Recoverer) - 结算租约过期的孤儿任务
///
/// # 注意 / Note
///
/// [`Processor`](processor::Processor) 没有实现此 trait，因为它的 `shutdown()` 是异步的，需要等待工作者完成
/// [`Processor`](processor::Processor) does not implement this trait because its `shutdown()`
/// is async and waits for in-flight workers
pub trait ComponentLifecycle {
  /// 启动组件
  /// Start the component
  ///
  /// 返回一个 `JoinHandle<()>`，可用于等待组件任务完成
  /// Returns a `JoinHandle<()>` that can be used to wait for the component task to complete
  fn start(self: Arc<Self>) -> JoinHandle<()>;

  /// 关闭组件
  /// Shutdown the component
  fn shutdown(&self);

  /// 检查组件是否已完成
  /// Check if the component is done
  fn is_done(&self) -> bool;
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio_util::sync::CancellationToken;

  struct TestComponent {
    done: CancellationToken,
  }

  impl ComponentLifecycle for TestComponent {
    fn start(self: Arc<Self>) -> JoinHandle<()> {
      tokio::spawn(async move {
        self.done.cancelled().await;
      })
    }

    fn shutdown(&self) {
      self.done.cancel();
    }

    fn is_done(&self) -> bool {
      self.done.is_cancelled()
    }
  }

  #[tokio::test]
  async fn test_lifecycle_trait() {
    let component = Arc::new(TestComponent {
      done: CancellationToken::new(),
    });

    assert!(!component.is_done());
    let handle = component.clone().start();
    component.shutdown();

    assert!(component.is_done());
    handle.await.unwrap();
  }
}
