//! 报表计划模块
//! Report schedule module
//!
//! 定义计划报表的数据模型、周期计算、日期窗口解析以及执行历史记录
//! Defines the scheduled report model, recurrence math, date window resolution and execution history bookkeeping

use crate::base::constants::{DEFAULT_MAX_FAILURES, EXECUTION_HISTORY_CAP};
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, Months, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 报表类型
/// Report type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportType {
  Sales,
  MenuPerformance,
  CustomerAnalytics,
  FinancialSummary,
  StaffPerformance,
  BranchPerformance,
}

impl ReportType {
  /// 队列优先级，数值越大越先被处理
  /// Queue priority, higher values are dispatched first
  pub fn priority(&self) -> i32 {
    match self {
      Self::FinancialSummary => 10,
      Self::Sales => 8,
      Self::BranchPerformance => 6,
      Self::StaffPerformance => 4,
      Self::CustomerAnalytics => 2,
      Self::MenuPerformance => 1,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Sales => "sales",
      Self::MenuPerformance => "menu-performance",
      Self::CustomerAnalytics => "customer-analytics",
      Self::FinancialSummary => "financial-summary",
      Self::StaffPerformance => "staff-performance",
      Self::BranchPerformance => "branch-performance",
    }
  }
}

impl fmt::Display for ReportType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl FromStr for ReportType {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "sales" => Ok(Self::Sales),
      "menu-performance" => Ok(Self::MenuPerformance),
      "customer-analytics" => Ok(Self::CustomerAnalytics),
      "financial-summary" => Ok(Self::FinancialSummary),
      "staff-performance" => Ok(Self::StaffPerformance),
      "branch-performance" => Ok(Self::BranchPerformance),
      other => Err(Error::validation(format!("unknown report type: {other}"))),
    }
  }
}

/// 报表输出格式
/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
  Pdf,
  Excel,
}

impl ReportFormat {
  /// 文件扩展名
  /// File extension
  pub fn extension(&self) -> &'static str {
    match self {
      Self::Pdf => "pdf",
      Self::Excel => "xlsx",
    }
  }
}

/// 执行频率
/// Execution frequency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
  Daily,
  Weekly,
  Monthly,
}

/// 计算下一次执行时间
/// Calculate the next run time
///
/// 结果总是严格晚于 `reference`
/// The result is always strictly after `reference`
pub fn calculate_next_run(frequency: Frequency, reference: DateTime<Utc>) -> DateTime<Utc> {
  match frequency {
    Frequency::Daily => reference + Duration::hours(24),
    Frequency::Weekly => reference + Duration::days(7),
    Frequency::Monthly => reference
      .checked_add_months(Months::new(1))
      .unwrap_or_else(|| reference + Duration::days(30)),
  }
}

/// 报表日期范围参数
/// Report date range parameter
///
/// 序列化为 `"auto"` 或天数整数
/// Serialized as `"auto"` or an integer day count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "DateRangeRepr", into = "DateRangeRepr")]
pub enum DateRange {
  #[default]
  Auto,
  Days(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum DateRangeRepr {
  Days(u32),
  Keyword(String),
}

impl TryFrom<DateRangeRepr> for DateRange {
  type Error = String;

  fn try_from(value: DateRangeRepr) -> std::result::Result<Self, Self::Error> {
    match value {
      DateRangeRepr::Days(days) => Ok(Self::Days(days)),
      DateRangeRepr::Keyword(k) if k == "auto" => Ok(Self::Auto),
      DateRangeRepr::Keyword(k) => Err(format!("invalid dateRange: {k}")),
    }
  }
}

impl From<DateRange> for DateRangeRepr {
  fn from(value: DateRange) -> Self {
    match value {
      DateRange::Auto => Self::Keyword("auto".to_string()),
      DateRange::Days(days) => Self::Days(days),
    }
  }
}

/// 半开区间的报表时间窗口 `[start, end)`
/// Half-open report window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWindow {
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

impl ReportWindow {
  /// 用于邮件模板的可读区间
  /// Human readable period used by email templates
  pub fn label(&self) -> String {
    let last_day = self.end - Duration::seconds(1);
    format!(
      "{} - {}",
      self.start.format("%Y-%m-%d"),
      last_day.format("%Y-%m-%d")
    )
  }
}

impl DateRange {
  /// 将日期范围解析为具体窗口
  /// Resolve the date range into a concrete window
  ///
  /// `Auto` 按频率取上一个完整周期：日报为昨天，周报为截至今天零点的 7 天，月报为上一个自然月
  /// `Auto` takes the previous full period for the frequency: yesterday for daily,
  /// the 7 days ending at today's midnight for weekly, the previous calendar month for monthly
  pub fn resolve(&self, frequency: Frequency, now: DateTime<Utc>) -> ReportWindow {
    match self {
      DateRange::Days(days) => ReportWindow {
        start: now - Duration::days(i64::from(*days)),
        end: now,
      },
      DateRange::Auto => {
        let today = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        match frequency {
          Frequency::Daily => ReportWindow {
            start: today - Duration::days(1),
            end: today,
          },
          Frequency::Weekly => ReportWindow {
            start: today - Duration::days(7),
            end: today,
          },
          Frequency::Monthly => {
            let month_start = today - Duration::days(i64::from(today.day0()));
            let previous = month_start
              .checked_sub_months(Months::new(1))
              .unwrap_or(month_start - Duration::days(30));
            ReportWindow {
              start: previous,
              end: month_start,
            }
          }
        }
      }
    }
  }
}

/// 报表参数
/// Report parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportParameters {
  pub date_range: DateRange,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub branch_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub period: Option<Frequency>,
}

/// 计划所有者，用于路由失败通知
/// Schedule owner, used to route failure notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
  pub user_id: String,
  pub email: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

/// 执行状态
/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
  Success,
  Failure,
}

/// 执行历史条目
/// Execution history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
  pub status: ExecutionStatus,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub report_id: Option<String>,
  pub duration_ms: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub recipient_count: Option<usize>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub failed_recipients: Vec<String>,
  pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
  pub fn success(
    report_id: String,
    duration_ms: u64,
    recipient_count: usize,
    failed_recipients: Vec<String>,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self {
      status: ExecutionStatus::Success,
      error: None,
      report_id: Some(report_id),
      duration_ms,
      recipient_count: Some(recipient_count),
      failed_recipients,
      timestamp,
    }
  }

  pub fn failure(error: String, duration_ms: u64, timestamp: DateTime<Utc>) -> Self {
    Self {
      status: ExecutionStatus::Failure,
      error: Some(error),
      report_id: None,
      duration_ms,
      recipient_count: None,
      failed_recipients: Vec::new(),
      timestamp,
    }
  }
}

/// 记录一次执行后对计划产生的影响
/// Effect of recording one execution on a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionEffect {
  pub failure_count: u32,
  /// 本次执行导致计划被自动停用
  /// This execution caused the schedule to be auto-disabled
  pub disabled_now: bool,
}

/// 计划的派生状态
/// Derived schedule status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
  Inactive,
  Failed,
  Scheduled,
  Ready,
}

/// 计划报表
/// Scheduled report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReport {
  pub id: String,
  pub tenant_id: String,
  pub report_type: ReportType,
  pub title: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub parameters: ReportParameters,
  pub recipients: Vec<String>,
  pub format: ReportFormat,
  pub frequency: Frequency,
  #[serde(default = "default_timezone")]
  pub timezone: String,
  pub next_run: DateTime<Utc>,
  pub is_active: bool,
  #[serde(default)]
  pub failure_count: u32,
  #[serde(default = "default_max_failures")]
  pub max_failures: u32,
  #[serde(default)]
  pub execution_history: Vec<ExecutionRecord>,
  pub created_by: Owner,
  #[serde(default)]
  pub last_run: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_success: Option<DateTime<Utc>>,
  #[serde(default)]
  pub last_failure: Option<DateTime<Utc>>,
  #[serde(default)]
  pub total_runs: u64,
  #[serde(default)]
  pub successful_runs: u64,
}

fn default_timezone() -> String {
  "UTC".to_string()
}

fn default_max_failures() -> u32 {
  DEFAULT_MAX_FAILURES
}

impl ScheduledReport {
  /// 创建新的计划报表，其余字段使用默认值
  /// Create a new scheduled report, remaining fields take their defaults
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: impl Into<String>,
    tenant_id: impl Into<String>,
    report_type: ReportType,
    title: impl Into<String>,
    recipients: Vec<String>,
    frequency: Frequency,
    next_run: DateTime<Utc>,
    created_by: Owner,
  ) -> Self {
    Self {
      id: id.into(),
      tenant_id: tenant_id.into(),
      report_type,
      title: title.into(),
      description: None,
      parameters: ReportParameters::default(),
      recipients,
      format: ReportFormat::Pdf,
      frequency,
      timezone: default_timezone(),
      next_run,
      is_active: true,
      failure_count: 0,
      max_failures: DEFAULT_MAX_FAILURES,
      execution_history: Vec::new(),
      created_by,
      last_run: None,
      last_success: None,
      last_failure: None,
      total_runs: 0,
      successful_runs: 0,
    }
  }

  /// 校验计划参数
  /// Validate schedule parameters
  pub fn validate(&self) -> Result<()> {
    if self.title.trim().is_empty() {
      return Err(Error::validation("schedule title must not be empty"));
    }
    if self.recipients.is_empty() {
      return Err(Error::validation("schedule must have at least one recipient"));
    }
    if self.max_failures == 0 {
      return Err(Error::validation("maxFailures must be at least 1"));
    }
    if self.parameters.date_range == DateRange::Days(0) {
      return Err(Error::validation("dateRange must cover at least one day"));
    }
    Ok(())
  }

  /// 是否到期
  /// Whether the schedule is due
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.is_active && self.next_run <= now
  }

  /// 记录一次最终执行结果
  /// Record one terminal execution outcome
  ///
  /// 成功会把 `failure_count` 归零；失败累加，达到 `max_failures` 时停用计划
  /// Success resets `failure_count`; failures accumulate and disable the schedule at `max_failures`
  pub fn record_execution(&mut self, record: ExecutionRecord) -> ExecutionEffect {
    let at = record.timestamp;
    let status = record.status;
    self.execution_history.push(record);
    if self.execution_history.len() > EXECUTION_HISTORY_CAP {
      let excess = self.execution_history.len() - EXECUTION_HISTORY_CAP;
      self.execution_history.drain(..excess);
    }

    self.last_run = Some(at);
    self.total_runs += 1;

    let mut disabled_now = false;
    match status {
      ExecutionStatus::Success => {
        self.last_success = Some(at);
        self.successful_runs += 1;
        self.failure_count = 0;
      }
      ExecutionStatus::Failure => {
        self.last_failure = Some(at);
        self.failure_count += 1;
        if self.failure_count >= self.max_failures && self.is_active {
          self.is_active = false;
          disabled_now = true;
        }
      }
    }

    ExecutionEffect {
      failure_count: self.failure_count,
      disabled_now,
    }
  }

  /// 成功率（四舍五入的百分比）
  /// Success rate as a rounded percentage
  pub fn success_rate(&self) -> u32 {
    if self.total_runs == 0 {
      return 0;
    }
    ((self.successful_runs as f64 / self.total_runs as f64) * 100.0).round() as u32
  }

  pub fn status(&self, now: DateTime<Utc>) -> ScheduleStatus {
    if !self.is_active {
      ScheduleStatus::Inactive
    } else if self.failure_count > 0 {
      ScheduleStatus::Failed
    } else if self.next_run > now {
      ScheduleStatus::Scheduled
    } else {
      ScheduleStatus::Ready
    }
  }
}
