//! 同步调度模块
//!
//! 该模块负责同步任务的定义、调度与执行，包括：
//! - cron 表达式解析：纯函数计算下次触发时间
//! - 同步任务抽象：配置句柄 + 一次同步周期
//! - 调度执行器：动态注册、独立触发、排空停止与协作式取消
//! - 具体任务：产品同步、产品淘汰
//! - 管理器：把配置注册表与执行器保持一致
//!
//! ## 使用示例
//!
//! ```ignore
//! let registry = Arc::new(ConfigurationRegistry::load(Box::new(JsonFileStore::new(path)))?);
//! let executor = Arc::new(SchedulingExecutor::new(Duration::from_secs(1)));
//! let factory = Arc::new(DirectorySynchronizerFactory::new(store, 64 * 1024));
//!
//! let manager = SynchronizerManager::new(registry, executor, factory);
//! manager.load_all();
//! manager.start(false);
//!
//! // 关闭时排空
//! manager.stop();
//! manager.executor().wait_until_stopped().await;
//! ```

pub mod configuration;
pub mod cron;
pub mod error;
pub mod eviction;
pub mod executor;
pub mod factory;
pub mod manager;
pub mod product;
pub mod task;

pub use configuration::{ConfigurationHandle, NewTaskConfiguration, TaskConfiguration, TaskKind};
pub use cron::{CronError, CronSchedule};
pub use error::SyncError;
pub use eviction::{EvictionSynchronizer, EvictionTrigger};
pub use executor::{SchedulingExecutor, SyncOutcome, SynchronizerStatus, DEFAULT_TICK_INTERVAL};
pub use factory::{BuiltSynchronizer, DirectorySynchronizerFactory, SynchronizerFactory};
pub use manager::{BandwidthReport, SynchronizerManager};
pub use product::{ProductCursor, ProductSource, ProductStore, ProductSynchronizer, ProductTransfer, RemoteProduct};
pub use task::{SharedTask, SyncContext, SynchronizationTask};
