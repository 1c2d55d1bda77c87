//! 淘汰同步器
//!
//! 按调度周期调用外部淘汰触发器。淘汰策略本身由触发器实现决定

use super::configuration::{ConfigurationHandle, TaskKind};
use super::error::SyncError;
use super::task::{SyncContext, SynchronizationTask};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// 淘汰触发器
#[async_trait]
pub trait EvictionTrigger: Send + Sync {
    /// 淘汰早于保留期限的产品，返回淘汰数量
    async fn evict(
        &self,
        retention: chrono::Duration,
        ctx: &SyncContext,
    ) -> Result<usize, SyncError>;
}

/// 淘汰同步器
pub struct EvictionSynchronizer {
    handle: ConfigurationHandle,
    trigger: Arc<dyn EvictionTrigger>,
}

impl EvictionSynchronizer {
    pub fn new(handle: ConfigurationHandle, trigger: Arc<dyn EvictionTrigger>) -> Self {
        Self { handle, trigger }
    }
}

#[async_trait]
impl SynchronizationTask for EvictionSynchronizer {
    fn handle(&self) -> &ConfigurationHandle {
        &self.handle
    }

    async fn synchronize(&self, ctx: &SyncContext) -> Result<bool, SyncError> {
        ctx.check_cancelled()?;

        let retention_days = match self.handle.snapshot().kind {
            TaskKind::Eviction { retention_days } => retention_days,
            other => {
                return Err(SyncError::Task(anyhow!(
                    "淘汰同步器 {} 的配置类型不匹配: {}",
                    self.handle.id(),
                    other.name()
                )))
            }
        };

        let evicted = self
            .trigger
            .evict(chrono::Duration::days(i64::from(retention_days)), ctx)
            .await?;

        if evicted > 0 {
            info!(
                "淘汰同步器 {} 已淘汰 {} 个产品（保留 {} 天）",
                self.handle.id(),
                evicted,
                retention_days
            );
        } else {
            debug!("淘汰同步器 {} 没有需要淘汰的产品", self.handle.id());
        }

        Ok(evicted > 0)
    }
}
