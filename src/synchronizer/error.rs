//! 同步错误定义

use super::cron::CronError;
use thiserror::Error;

/// 同步引擎错误
///
/// 只有 `InvalidArgument`、`Configuration` 和 `NotFound` 会返回给调用方；
/// `Task` 与 `Cancelled` 由执行器内部吸收并记录日志
#[derive(Debug, Error)]
pub enum SyncError {
    /// 参数无效（如注册空任务、重复 ID）
    #[error("参数无效: {0}")]
    InvalidArgument(String),

    /// cron 表达式无效
    #[error("同步器 {id} 的调度表达式无效: {source}")]
    Configuration {
        id: i64,
        #[source]
        source: CronError,
    },

    /// 同步器不存在
    #[error("同步器不存在: {0}")]
    NotFound(i64),

    /// 同步执行失败
    #[error("同步失败: {0:#}")]
    Task(#[from] anyhow::Error),

    /// 观察到取消信号
    #[error("同步已取消")]
    Cancelled,
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}
