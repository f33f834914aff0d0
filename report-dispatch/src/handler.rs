//! 任务处理器模块
//! Job handler module
//!
//! 端到端执行一个报表任务：解析日期窗口、获取分析数据、渲染报表、逐个收件人发送邮件
//! Runs one report job end to end: resolve the window, fetch analytics, render, email each recipient
//!
//! 所有协作服务错误都会在这里被分类为 `Transient` 或 `Validation`，单个收件人的投递失败只记录日志
//! Every collaborator error is classified here as `Transient` or `Validation`;
//! a single recipient's delivery failure is only logged

use crate::base::constants::{REPORT_EMAIL_TEMPLATE, SYSTEM_GENERATED_BY, SYSTEM_USER_ID, TIME_LAYOUT_YMD};
use crate::clock::Clock;
use crate::collaborators::{
  AnalyticsProvider, AnalyticsQuery, Attachment, CollaboratorError, EmailMessage, EmailSender,
  RenderContext, RenderRequest, ReportRenderer,
};
use crate::error::{Error, Result};
use crate::job::JobMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 任务处理器特性
/// Job handler trait
#[async_trait]
pub trait JobHandler: Send + Sync {
  /// 处理任务
  /// Process a job
  async fn process(&self, job: &JobMessage) -> Result<JobOutcome>;
}

/// 成功执行的结果
/// Outcome of a successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
  pub report_id: String,
  pub file_name: String,
  pub file_path: String,
  pub duration_ms: u64,
  /// 尝试投递的收件人数
  /// Number of recipients a delivery was attempted for
  pub recipient_count: usize,
  pub failed_recipients: Vec<String>,
}

impl JobOutcome {
  /// 是否只投递给了部分收件人
  /// Whether only some recipients received the report
  pub fn is_partial(&self) -> bool {
    !self.failed_recipients.is_empty()
  }
}

/// 报表文件名：`{report-type}-{YYYY-MM-DD}.{ext}`
/// Report file name: `{report-type}-{YYYY-MM-DD}.{ext}`
pub fn report_file_name(job: &JobMessage, generated_at: chrono::DateTime<chrono::Utc>) -> String {
  format!(
    "{}-{}.{}",
    job.payload.report_type,
    generated_at.format(TIME_LAYOUT_YMD),
    job.payload.format.extension()
  )
}

/// 报表任务处理器
/// Report job handler
pub struct ReportJobHandler {
  analytics: Arc<dyn AnalyticsProvider>,
  renderer: Arc<dyn ReportRenderer>,
  email: Arc<dyn EmailSender>,
  clock: Arc<dyn Clock>,
  call_timeout: Duration,
}

impl ReportJobHandler {
  pub fn new(
    analytics: Arc<dyn AnalyticsProvider>,
    renderer: Arc<dyn ReportRenderer>,
    email: Arc<dyn EmailSender>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
  ) -> Self {
    Self {
      analytics,
      renderer,
      email,
      clock,
      call_timeout,
    }
  }

  /// 带超时地调用协作服务，并把错误分类
  /// Call a collaborator with a timeout and classify its error
  async fn call<T, F>(&self, what: &str, fut: F) -> Result<T>
  where
    F: Future<Output = std::result::Result<T, CollaboratorError>>,
  {
    match tokio::time::timeout(self.call_timeout, fut).await {
      Ok(Ok(value)) => Ok(value),
      Ok(Err(e)) => Err(classify(what, e)),
      Err(_) => Err(Error::transient(format!(
        "{what} timed out after {:?}",
        self.call_timeout
      ))),
    }
  }
}

/// 校验错误不重试，其余协作服务错误都视为暂时性错误
/// Validation errors are not retried, every other collaborator error is transient
fn classify(what: &str, err: CollaboratorError) -> Error {
  if err.is_validation() {
    Error::validation(format!("{what}: {err}"))
  } else {
    Error::transient(format!("{what}: {err}"))
  }
}

#[async_trait]
impl JobHandler for ReportJobHandler {
  async fn process(&self, job: &JobMessage) -> Result<JobOutcome> {
    let started = Instant::now();
    let now = self.clock.now();
    let payload = &job.payload;

    if payload.recipients.is_empty() {
      return Err(Error::validation("job has no recipients"));
    }

    let window = payload
      .parameters
      .date_range
      .resolve(payload.frequency, now);

    let query = AnalyticsQuery {
      report_type: payload.report_type,
      tenant_id: job.tenant_id.clone(),
      window,
      branch_id: payload.parameters.branch_id.clone(),
      period: payload.parameters.period,
    };
    let data = self.call("analytics", self.analytics.generate(query)).await?;

    let request = RenderRequest {
      report_type: payload.report_type,
      data,
      format: payload.format,
      context: RenderContext {
        title: payload.title.clone(),
        tenant_id: job.tenant_id.clone(),
        generated_by: SYSTEM_GENERATED_BY.to_string(),
        user_id: SYSTEM_USER_ID.to_string(),
        window,
        file_name: report_file_name(job, now),
      },
    };
    let rendered = self.call("render", self.renderer.render(request)).await?;

    let mut failed_recipients = Vec::new();
    for recipient in &payload.recipients {
      let message = EmailMessage {
        to: recipient.clone(),
        subject: format!("Scheduled Report: {}", payload.title),
        template: REPORT_EMAIL_TEMPLATE.to_string(),
        template_data: serde_json::json!({
          "reportTitle": payload.title,
          "reportPeriod": window.label(),
          "generatedAt": now.to_rfc3339(),
          "recipientEmail": recipient,
        }),
        attachment: Attachment {
          file_name: rendered.file_name.clone(),
          file_path: rendered.file_path.clone(),
        },
      };
      if let Err(e) = self.call("email", self.email.send(message)).await {
        let err = Error::delivery(recipient.clone(), e.to_string());
        tracing::warn!(job_id = %job.id, "{}", err);
        failed_recipients.push(recipient.clone());
      }
    }

    Ok(JobOutcome {
      report_id: rendered.report_id,
      file_name: rendered.file_name,
      file_path: rendered.file_path,
      duration_ms: as_millis(started.elapsed()),
      recipient_count: payload.recipients.len(),
      failed_recipients,
    })
  }
}

/// 毫秒数，超出 u64 时饱和
/// Milliseconds, saturating at u64::MAX
pub(crate) fn as_millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
