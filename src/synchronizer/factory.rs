//! 同步器工厂
//!
//! 根据配置记录构建具体的同步任务

use super::configuration::{ConfigurationHandle, TaskConfiguration, TaskKind};
use super::eviction::EvictionSynchronizer;
use super::product::ProductSynchronizer;
use super::task::SharedTask;
use crate::bandwidth::BandwidthTracker;
use crate::storage::{DirectoryProductStore, DirectorySource};
use anyhow::Result;
use std::sync::Arc;

/// 构建结果
pub struct BuiltSynchronizer {
    pub task: SharedTask,
    /// 产品同步器的数据源带宽追踪器
    pub tracker: Option<Arc<BandwidthTracker>>,
}

/// 同步器工厂
pub trait SynchronizerFactory: Send + Sync {
    fn build(&self, configuration: TaskConfiguration) -> Result<BuiltSynchronizer>;
}

/// 基于目录的默认工厂
///
/// 产品任务从配置中的数据源目录拉取，写入共享的产品目录；
/// 淘汰任务作用于同一个产品目录
pub struct DirectorySynchronizerFactory {
    store: Arc<DirectoryProductStore>,
    chunk_size: usize,
}

impl DirectorySynchronizerFactory {
    pub fn new(store: Arc<DirectoryProductStore>, chunk_size: usize) -> Self {
        Self { store, chunk_size }
    }
}

impl SynchronizerFactory for DirectorySynchronizerFactory {
    fn build(&self, configuration: TaskConfiguration) -> Result<BuiltSynchronizer> {
        let kind = configuration.kind.clone();
        let handle = ConfigurationHandle::new(configuration);

        match kind {
            TaskKind::Product { source, .. } => {
                let source = Arc::new(DirectorySource::new(source, self.chunk_size));
                let synchronizer = ProductSynchronizer::new(handle, source, self.store.clone());
                let tracker = synchronizer.tracker();
                Ok(BuiltSynchronizer {
                    task: Arc::new(synchronizer),
                    tracker: Some(tracker),
                })
            }
            TaskKind::Eviction { .. } => Ok(BuiltSynchronizer {
                task: Arc::new(EvictionSynchronizer::new(handle, self.store.clone())),
                tracker: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synchronizer::task::SynchronizationTask;
    use std::path::PathBuf;

    #[test]
    fn test_build_by_kind() {
        let factory = DirectorySynchronizerFactory::new(
            Arc::new(DirectoryProductStore::new("/tmp/products")),
            4096,
        );

        let product = factory
            .build(TaskConfiguration {
                id: 1,
                label: "s1".to_string(),
                schedule: "0 * * * * ?".to_string(),
                active: true,
                kind: TaskKind::Product {
                    source: PathBuf::from("/mnt/s1"),
                    page_size: 10,
                    max_concurrent_transfers: 2,
                },
            })
            .unwrap();
        assert_eq!(product.task.id(), 1);
        assert_eq!(product.tracker.unwrap().source(), "/mnt/s1");

        let eviction = factory
            .build(TaskConfiguration {
                id: 2,
                label: "evict".to_string(),
                schedule: "0 0 3 * * ?".to_string(),
                active: false,
                kind: TaskKind::Eviction { retention_days: 30 },
            })
            .unwrap();
        assert_eq!(eviction.task.id(), 2);
        assert!(!eviction.task.is_active());
        assert!(eviction.tracker.is_none());
    }
}
