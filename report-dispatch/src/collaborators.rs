//! 协作服务模块
//! Collaborator module
//!
//! 引擎依赖的外部服务接口：计划存储、分析数据、报表渲染、邮件发送以及所有者通知
//! Contracts for the external services the engine depends on: schedule storage,
//! analytics, rendering, email delivery and owner notification

use crate::error::Result;
use crate::schedule::{
  ExecutionEffect, ExecutionRecord, Frequency, Owner, ReportFormat, ReportType, ReportWindow,
  ScheduledReport,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 协作服务返回的错误类型
/// Error kinds returned by collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
  /// 服务暂时不可用
  /// Service temporarily unavailable
  #[error("service unavailable: {0}")]
  Unavailable(String),
  /// 调用超时
  /// Call timed out
  #[error("timed out: {0}")]
  Timeout(String),
  /// 输入无效，重试无意义
  /// Invalid input, retrying will not help
  #[error("invalid input: {0}")]
  Validation(String),
  /// 生成失败
  /// Generation failed
  #[error("generation failed: {0}")]
  Generation(String),
  /// 投递失败
  /// Delivery failed
  #[error("delivery failed: {0}")]
  Delivery(String),
}

impl CollaboratorError {
  /// 是否为校验错误
  /// Whether this is a validation error
  pub fn is_validation(&self) -> bool {
    matches!(self, Self::Validation(_))
  }
}

/// 计划存储
/// Schedule repository
///
/// 对单个计划的修改必须是原子的
/// Mutations of a single schedule must be atomic
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
  /// 返回 `is_active && next_run <= now` 的计划，按 `next_run` 升序
  /// Return schedules with `is_active && next_run <= now`, ordered by `next_run` ascending
  async fn find_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledReport>>;

  async fn get(&self, id: &str) -> Result<Option<ScheduledReport>>;

  /// 保存计划
  /// Persist a schedule
  async fn save(&self, schedule: &ScheduledReport) -> Result<()>;

  /// 仅当当前 `next_run == expected` 时把它推进到 `next`
  /// Advance `next_run` to `next` only if it currently equals `expected`
  ///
  /// 返回是否成功，失败说明这次到期已经被其他检测器认领
  /// Returns whether it succeeded; failure means another detector already claimed this occurrence
  async fn advance_next_run(
    &self,
    id: &str,
    expected: DateTime<Utc>,
    next: DateTime<Utc>,
  ) -> Result<bool>;

  /// 原子地将执行记录应用到计划上，计划不存在时返回 `None`
  /// Atomically apply an execution record to a schedule, `None` if the schedule no longer exists
  async fn record_execution(
    &self,
    id: &str,
    record: ExecutionRecord,
  ) -> Result<Option<(ScheduledReport, ExecutionEffect)>>;
}

/// 分析数据请求
/// Analytics query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
  pub report_type: ReportType,
  pub tenant_id: String,
  pub window: ReportWindow,
  pub branch_id: Option<String>,
  pub period: Option<Frequency>,
}

/// 不透明的报表数据
/// Opaque report data
pub type ReportData = serde_json::Value;

#[async_trait]
pub trait AnalyticsProvider: Send + Sync {
  async fn generate(&self, query: AnalyticsQuery) -> std::result::Result<ReportData, CollaboratorError>;
}

/// 渲染上下文
/// Render context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderContext {
  pub title: String,
  pub tenant_id: String,
  pub generated_by: String,
  pub user_id: String,
  pub window: ReportWindow,
  /// 建议的文件名
  /// Suggested file name
  pub file_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderRequest {
  pub report_type: ReportType,
  pub data: ReportData,
  pub format: ReportFormat,
  pub context: RenderContext,
}

/// 已渲染的报表
/// Rendered report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedReport {
  pub report_id: String,
  pub file_name: String,
  pub file_path: String,
}

#[async_trait]
pub trait ReportRenderer: Send + Sync {
  async fn render(&self, request: RenderRequest) -> std::result::Result<RenderedReport, CollaboratorError>;
}

/// 邮件附件
/// Email attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
  pub file_name: String,
  pub file_path: String,
}

/// 报表邮件
/// Report email
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailMessage {
  pub to: String,
  pub subject: String,
  pub template: String,
  pub template_data: serde_json::Value,
  pub attachment: Attachment,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
  /// 每个收件人独立发送
  /// Sent independently per recipient
  async fn send(&self, message: EmailMessage) -> std::result::Result<(), CollaboratorError>;
}

/// 计划被自动停用时发给所有者的通知
/// Notice sent to the owner when a schedule is auto-disabled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureNotice {
  pub subject: String,
  pub template: String,
  pub report_title: String,
  pub error_message: String,
  pub failure_count: u32,
  pub max_failures: u32,
  pub schedule_id: String,
  pub owner: Owner,
  pub will_disable: bool,
}

#[async_trait]
pub trait OwnerNotifier: Send + Sync {
  async fn notify_owner(
    &self,
    schedule: &ScheduledReport,
    notice: &FailureNotice,
  ) -> std::result::Result<(), CollaboratorError>;
}
