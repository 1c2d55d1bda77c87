//! 同步任务配置

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// 同步任务配置记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    /// 唯一 ID（由注册表分配）
    pub id: i64,
    /// 名称（大小写不敏感唯一）
    pub label: String,
    /// cron 调度表达式
    pub schedule: String,
    /// 是否启用
    #[serde(default = "default_active")]
    pub active: bool,
    /// 任务类型及其参数
    #[serde(flatten)]
    pub kind: TaskKind,
}

/// 新建配置（ID 尚未分配）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTaskConfiguration {
    pub label: String,
    pub schedule: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(flatten)]
    pub kind: TaskKind,
}

impl NewTaskConfiguration {
    pub fn into_configuration(self, id: i64) -> TaskConfiguration {
        TaskConfiguration {
            id,
            label: self.label,
            schedule: self.schedule,
            active: self.active,
            kind: self.kind,
        }
    }
}

/// 任务类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// 从数据源拉取产品
    Product {
        /// 数据源根目录
        source: PathBuf,
        /// 每轮最多处理的产品数
        #[serde(default = "default_page_size")]
        page_size: usize,
        /// 最大并发传输数
        #[serde(default = "default_max_concurrent_transfers")]
        max_concurrent_transfers: usize,
    },
    /// 淘汰过期产品
    Eviction {
        /// 保留天数
        retention_days: u32,
    },
}

impl TaskKind {
    /// 类型名称（用于日志和重建判断）
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Product { .. } => "product",
            TaskKind::Eviction { .. } => "eviction",
        }
    }
}

fn default_active() -> bool {
    true
}

fn default_page_size() -> usize {
    50
}

fn default_max_concurrent_transfers() -> usize {
    4
}

/// 任务持有的共享配置句柄
///
/// 管理器更新配置后，任务在下一个调度周期读取到新值
#[derive(Debug, Clone)]
pub struct ConfigurationHandle {
    id: i64,
    inner: Arc<RwLock<TaskConfiguration>>,
}

impl ConfigurationHandle {
    pub fn new(configuration: TaskConfiguration) -> Self {
        Self {
            id: configuration.id,
            inner: Arc::new(RwLock::new(configuration)),
        }
    }

    /// ID 在任务生命周期内不变
    pub fn id(&self) -> i64 {
        self.id
    }

    /// 当前配置快照
    pub fn snapshot(&self) -> TaskConfiguration {
        self.inner.read().clone()
    }

    pub fn label(&self) -> String {
        self.inner.read().label.clone()
    }

    pub fn schedule(&self) -> String {
        self.inner.read().schedule.clone()
    }

    pub fn set_schedule(&self, schedule: impl Into<String>) {
        self.inner.write().schedule = schedule.into();
    }

    pub fn is_active(&self) -> bool {
        self.inner.read().active
    }

    pub fn set_active(&self, active: bool) {
        self.inner.write().active = active;
    }

    /// 整体替换配置，ID 保持不变
    pub fn replace(&self, mut configuration: TaskConfiguration) {
        configuration.id = self.id;
        *self.inner.write() = configuration;
    }
}
