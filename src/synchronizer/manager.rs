//! 同步器管理器
//!
//! 把配置注册表与调度执行器保持一致：配置的增删改同步反映到执行器中的任务

use super::configuration::{NewTaskConfiguration, TaskConfiguration};
use super::error::SyncError;
use super::executor::SchedulingExecutor;
use super::factory::SynchronizerFactory;
use super::task::SharedTask;
use crate::bandwidth::BandwidthTracker;
use crate::registry::{ConfigurationRegistry, RegistryError};
use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// 数据源带宽报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BandwidthReport {
    pub source: String,
    /// 字节/窗口，窗口未填满时为 -1
    pub bandwidth: i64,
    pub concurrent_downloads: usize,
}

/// 已注册到执行器的任务
struct ManagedTask {
    task: SharedTask,
    tracker: Option<Arc<BandwidthTracker>>,
}

/// 同步器管理器
pub struct SynchronizerManager {
    registry: Arc<ConfigurationRegistry>,
    executor: Arc<SchedulingExecutor>,
    factory: Arc<dyn SynchronizerFactory>,
    tasks: DashMap<i64, ManagedTask>,
}

impl SynchronizerManager {
    pub fn new(
        registry: Arc<ConfigurationRegistry>,
        executor: Arc<SchedulingExecutor>,
        factory: Arc<dyn SynchronizerFactory>,
    ) -> Self {
        Self {
            registry,
            executor,
            factory,
            tasks: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConfigurationRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<SchedulingExecutor> {
        &self.executor
    }

    /// 为注册表中的所有配置构建并注册任务
    ///
    /// 单个配置失败只记录日志，返回成功注册的数量
    pub fn load_all(&self) -> usize {
        let mut loaded = 0;
        for configuration in self.registry.list() {
            let id = configuration.id;
            let label = configuration.label.clone();
            match self.register(configuration) {
                Ok(()) => loaded += 1,
                Err(e) => error!("加载同步器 {} ({}) 失败: {:#}", id, label, e),
            }
        }

        info!("已加载 {} 个同步器", loaded);
        loaded
    }

    /// 构建任务并注册到执行器
    fn register(&self, configuration: TaskConfiguration) -> Result<()> {
        let id = configuration.id;
        let kind = configuration.kind.name();
        let built = self
            .factory
            .build(configuration)
            .with_context(|| format!("构建 {} 同步器失败", kind))?;

        self.executor.add_synchronizer(Some(built.task.clone()))?;
        self.tasks.insert(
            id,
            ManagedTask {
                task: built.task,
                tracker: built.tracker,
            },
        );
        Ok(())
    }

    /// 从执行器中移除任务（不存在时忽略）
    fn unregister(&self, id: i64) {
        self.tasks.remove(&id);
        match self.executor.remove_synchronizer(id) {
            Ok(()) | Err(SyncError::NotFound(_)) => {}
            Err(e) => warn!("移除同步器 {} 失败: {}", id, e),
        }
    }

    /// 新建同步器
    ///
    /// 注册到执行器失败时回滚注册表中的配置
    pub fn create(&self, new: NewTaskConfiguration) -> Result<TaskConfiguration> {
        let configuration = self.registry.create(new)?;

        if let Err(e) = self.register(configuration.clone()) {
            if let Err(rollback) = self.registry.delete(configuration.id) {
                error!("回滚同步器配置 {} 失败: {}", configuration.id, rollback);
            }
            return Err(e);
        }

        Ok(configuration)
    }

    /// 更新同步器配置
    ///
    /// 类型参数不变时原地更新配置句柄，任务在下一轮调度读取新值；
    /// 否则重新构建任务
    pub fn update(&self, configuration: TaskConfiguration) -> Result<TaskConfiguration> {
        let id = configuration.id;
        let previous = self
            .registry
            .get(id)
            .ok_or(RegistryError::NotFound(id))?;
        let configuration = self.registry.update(configuration)?;

        // 数据源等类型参数在构建时固化，任何变化都需要重建
        let in_place = previous.kind == configuration.kind;

        let existing = self.tasks.get(&id).map(|managed| managed.task.clone());
        match existing {
            Some(task) if in_place => {
                task.handle().replace(configuration.clone());
                info!("同步器 {} 配置已原地更新", id);
            }
            _ => {
                self.unregister(id);
                self.register(configuration.clone())
                    .with_context(|| format!("重新注册同步器 {} 失败", id))?;
                info!("同步器 {} 已按新配置重建", id);
            }
        }

        Ok(configuration)
    }

    /// 删除同步器，在途执行正常结束
    pub fn delete(&self, id: i64) -> Result<TaskConfiguration> {
        let removed = self.registry.delete(id)?;
        self.unregister(id);
        Ok(removed)
    }

    /// 手动触发
    pub fn trigger(&self, id: i64) -> Result<()> {
        self.executor.trigger(id)?;
        Ok(())
    }

    /// 按名称手动触发（大小写不敏感）
    pub fn trigger_by_label(&self, label: &str) -> Result<i64> {
        let configuration = self
            .registry
            .get_by_label(label)
            .with_context(|| format!("同步器不存在: {}", label))?;
        self.trigger(configuration.id)?;
        Ok(configuration.id)
    }

    /// 产品同步器的数据源带宽
    pub fn bandwidth(&self, id: i64) -> Option<BandwidthReport> {
        let managed = self.tasks.get(&id)?;
        let tracker = managed.tracker.as_ref()?;
        Some(BandwidthReport {
            source: tracker.source().to_string(),
            bandwidth: tracker.bandwidth(),
            concurrent_downloads: tracker.concurrent_download(),
        })
    }

    pub fn start(&self, batch_mode: bool) {
        self.executor.start(batch_mode);
    }

    pub fn stop(&self) {
        self.executor.stop();
    }

    pub fn terminate(&self) {
        self.executor.terminate();
    }
}
