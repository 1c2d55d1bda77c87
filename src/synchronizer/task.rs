//! 同步任务抽象
//!
//! 每个同步任务包装一份配置句柄，并提供一次同步周期的执行逻辑。
//! 执行器只通过这里定义的 trait 与任务交互

use super::configuration::{ConfigurationHandle, TaskConfiguration};
use super::error::SyncError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// 同步上下文
///
/// 携带协作式取消信号。`terminate()` 时令牌被取消，
/// 任务需要在入口以及长耗时循环中调用 `check_cancelled()`
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    cancellation_token: CancellationToken,
}

impl SyncContext {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self { cancellation_token }
    }

    /// 是否已收到取消信号
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// 已取消时返回 `SyncError::Cancelled`
    pub fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// 等待取消信号
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

/// 同步任务
#[async_trait]
pub trait SynchronizationTask: Send + Sync {
    /// 配置句柄
    fn handle(&self) -> &ConfigurationHandle;

    /// 执行一次同步周期
    ///
    /// # 返回
    /// - `Ok(true)`: 本轮处理了数据，可能还有更多待处理
    /// - `Ok(false)`: 没有需要处理的数据
    /// - `Err(SyncError::Cancelled)`: 观察到取消信号，必须直接向上传播
    async fn synchronize(&self, ctx: &SyncContext) -> Result<bool, SyncError>;

    fn id(&self) -> i64 {
        self.handle().id()
    }

    fn label(&self) -> String {
        self.handle().label()
    }

    fn configuration(&self) -> TaskConfiguration {
        self.handle().snapshot()
    }

    /// 当前调度表达式，修改后在下一个调度周期生效
    fn schedule(&self) -> String {
        self.handle().schedule()
    }

    fn set_schedule(&self, schedule: String) {
        self.handle().set_schedule(schedule)
    }

    fn is_active(&self) -> bool {
        self.handle().is_active()
    }

    fn set_active(&self, active: bool) {
        self.handle().set_active(active)
    }
}

/// 共享任务引用
pub type SharedTask = Arc<dyn SynchronizationTask>;
