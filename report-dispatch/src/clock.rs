//! 时钟模块
//! Clock module
//!
//! 所有到期检测与退避计算都通过可注入的时钟获取当前时间
//! Due detection and backoff computation read the current time through an injectable clock

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// 时钟特性
/// Clock trait
pub trait Clock: Send + Sync {
  /// 当前时间
  /// Current time
  fn now(&self) -> DateTime<Utc>;
}

/// 系统时钟
/// System clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// 手动时钟，用于测试中确定性地推进时间
/// Manual clock for deterministically advancing time in tests
#[derive(Debug)]
pub struct ManualClock {
  millis: AtomicI64,
}

impl ManualClock {
  /// 创建指定起始时间的手动时钟
  /// Create a manual clock starting at the given instant
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      millis: AtomicI64::new(start.timestamp_millis()),
    }
  }

  /// 设置当前时间
  /// Set the current time
  pub fn set(&self, now: DateTime<Utc>) {
    self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
  }

  /// 推进时间
  /// Advance time
  pub fn advance(&self, by: Duration) {
    self.millis.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn test_manual_clock_advance() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    assert_eq!(clock.now(), start);

    clock.advance(Duration::seconds(90));
    assert_eq!(clock.now(), start + Duration::seconds(90));

    clock.set(start);
    assert_eq!(clock.now(), start);
  }
}
