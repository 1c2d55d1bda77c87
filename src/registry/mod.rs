//! 同步任务配置注册表
//!
//! 内存中的配置 CRUD，每次变更后调用存储后端保存。
//! 保存失败只记录日志，不回滚内存中的变更
//!
//! ## 设计原则
//!
//! 1. **单锁**: 所有状态由一把 `parking_lot::RwLock` 保护，读者只会看到完整的变更前或变更后状态
//! 2. **ID 单调**: 首次创建时计算 `最大 ID + 1`，之后在内存中单调递增
//! 3. **名称唯一**: 名称大小写不敏感唯一

mod store;

pub use store::{ConfigurationStore, JsonFileStore};

use crate::synchronizer::{CronError, CronSchedule, NewTaskConfiguration, TaskConfiguration};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info, warn};

/// 注册表错误
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("同步器名称已存在: {0}")]
    DuplicateLabel(String),

    #[error("同步器名称不能为空")]
    EmptyLabel,

    #[error("同步器配置不存在: {0}")]
    NotFound(i64),

    #[error("调度表达式无效: {0}")]
    InvalidSchedule(#[from] CronError),

    #[error("加载同步器配置失败: {0:#}")]
    Persistence(anyhow::Error),
}

struct RegistryInner {
    records: BTreeMap<i64, TaskConfiguration>,
    /// 下一个可分配的 ID，首次创建时惰性计算
    next_id: Option<i64>,
}

impl RegistryInner {
    fn label_taken(&self, label: &str, except: Option<i64>) -> bool {
        let label = label.trim().to_lowercase();
        self.records
            .values()
            .any(|record| Some(record.id) != except && record.label.trim().to_lowercase() == label)
    }

    fn allocate_id(&mut self) -> i64 {
        let records = &self.records;
        let next = self
            .next_id
            .get_or_insert_with(|| records.keys().next_back().map_or(1, |max| max + 1));
        let id = *next;
        *next += 1;
        id
    }

    fn snapshot(&self) -> Vec<TaskConfiguration> {
        self.records.values().cloned().collect()
    }
}

/// 配置注册表
pub struct ConfigurationRegistry {
    store: Box<dyn ConfigurationStore>,
    inner: RwLock<RegistryInner>,
}

impl ConfigurationRegistry {
    /// 从存储后端加载
    pub fn load(store: Box<dyn ConfigurationStore>) -> Result<Self, RegistryError> {
        let configurations = store.load().map_err(RegistryError::Persistence)?;

        let mut records = BTreeMap::new();
        for configuration in configurations {
            if let Some(previous) = records.insert(configuration.id, configuration) {
                warn!("同步器配置 ID 重复，保留最后一条: {}", previous.id);
            }
        }

        info!("已加载 {} 个同步器配置", records.len());

        Ok(Self {
            store,
            inner: RwLock::new(RegistryInner {
                records,
                next_id: None,
            }),
        })
    }

    /// 新建配置并分配 ID
    pub fn create(&self, new: NewTaskConfiguration) -> Result<TaskConfiguration, RegistryError> {
        Self::validate(&new.label, &new.schedule)?;

        let mut inner = self.inner.write();
        if inner.label_taken(&new.label, None) {
            return Err(RegistryError::DuplicateLabel(new.label));
        }

        let id = inner.allocate_id();
        let configuration = new.into_configuration(id);
        inner.records.insert(id, configuration.clone());
        info!("创建同步器配置 {} ({})", id, configuration.label);

        self.persist(&inner);
        Ok(configuration)
    }

    /// 按 ID 整体替换配置
    pub fn update(&self, configuration: TaskConfiguration) -> Result<TaskConfiguration, RegistryError> {
        Self::validate(&configuration.label, &configuration.schedule)?;

        let mut inner = self.inner.write();
        if !inner.records.contains_key(&configuration.id) {
            return Err(RegistryError::NotFound(configuration.id));
        }
        if inner.label_taken(&configuration.label, Some(configuration.id)) {
            return Err(RegistryError::DuplicateLabel(configuration.label));
        }

        inner
            .records
            .insert(configuration.id, configuration.clone());
        info!("更新同步器配置 {} ({})", configuration.id, configuration.label);

        self.persist(&inner);
        Ok(configuration)
    }

    /// 删除配置
    pub fn delete(&self, id: i64) -> Result<TaskConfiguration, RegistryError> {
        let mut inner = self.inner.write();
        let removed = inner.records.remove(&id).ok_or(RegistryError::NotFound(id))?;
        info!("删除同步器配置 {} ({})", id, removed.label);

        self.persist(&inner);
        Ok(removed)
    }

    pub fn get(&self, id: i64) -> Option<TaskConfiguration> {
        self.inner.read().records.get(&id).cloned()
    }

    /// 按名称查找（大小写不敏感）
    pub fn get_by_label(&self, label: &str) -> Option<TaskConfiguration> {
        let label = label.trim().to_lowercase();
        self.inner
            .read()
            .records
            .values()
            .find(|record| record.label.trim().to_lowercase() == label)
            .cloned()
    }

    /// 所有配置，按 ID 升序
    pub fn list(&self) -> Vec<TaskConfiguration> {
        self.inner.read().snapshot()
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn validate(label: &str, schedule: &str) -> Result<(), RegistryError> {
        if label.trim().is_empty() {
            return Err(RegistryError::EmptyLabel);
        }
        CronSchedule::parse(schedule)?;
        Ok(())
    }

    /// 在写锁内保存，保证落盘顺序与变更顺序一致
    fn persist(&self, inner: &RegistryInner) {
        if let Err(e) = self.store.save(&inner.snapshot()) {
            error!("保存同步器配置失败，内存中的变更仍然有效: {:#}", e);
        }
    }
}
