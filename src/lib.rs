// Space Data Hub Synchronization Library
// 数据中心同步调度核心库

// 数据源带宽统计模块
pub mod bandwidth;

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 同步器配置注册表模块
pub mod registry;

// 本地目录数据源与产品存储模块
pub mod storage;

// 同步调度模块
pub mod synchronizer;

// 导出常用类型
pub use bandwidth::{BandwidthCalculator, BandwidthTracker, CalculatorGuard};
pub use config::AppConfig;
pub use registry::{ConfigurationRegistry, ConfigurationStore, JsonFileStore, RegistryError};
pub use storage::{DirectoryProductStore, DirectorySource};
pub use synchronizer::{
    BandwidthReport, CronSchedule, DirectorySynchronizerFactory, NewTaskConfiguration,
    SchedulingExecutor, SharedTask, SyncContext, SyncError, SynchronizationTask,
    SynchronizerManager, TaskConfiguration, TaskKind,
};
