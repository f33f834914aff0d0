use std::time::Duration;

/// 默认队列名称
pub const DEFAULT_QUEUE_NAME: &str = "scheduled-reports";

/// 默认工作者并发数
pub const DEFAULT_CONCURRENCY: usize = 5;
/// 默认最大执行次数（含首次）
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// 退避基础延迟
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(60);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);

/// 保留的已完成任务数量
pub const DEFAULT_COMPLETED_RETENTION: usize = 100;
/// 保留的失败任务数量
pub const DEFAULT_FAILED_RETENTION: usize = 50;
pub const DEFAULT_COMPLETED_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_FAILED_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// 到期检测轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_JOB_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FORWARD_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(8);
/// 工作者领取任务的租约时长，工作者存活时定期续约
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);
pub const DEFAULT_RECOVER_INTERVAL: Duration = Duration::from_secs(10);
/// 恢复租约过期任务时记录的错误
pub const LEASE_EXPIRED_ERROR: &str = "lease expired";
/// 单次协作服务调用超时
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 执行历史上限
pub const EXECUTION_HISTORY_CAP: usize = 50;
/// 默认连续失败上限
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// 调度器生成报表时使用的身份
pub const SYSTEM_GENERATED_BY: &str = "System Scheduler";
pub const SYSTEM_USER_ID: &str = "system";
pub const REPORT_EMAIL_TEMPLATE: &str = "scheduled-report";
pub const FAILURE_EMAIL_TEMPLATE: &str = "report-failure";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const TIME_LAYOUT_YMD: &str = "%Y-%m-%d";
