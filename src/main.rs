use datahub_sync::{
    config::{AppConfig, LogConfig},
    logging, ConfigurationRegistry, DirectoryProductStore, DirectorySynchronizerFactory,
    JsonFileStore, SchedulingExecutor, SynchronizerManager,
};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 加载日志配置
///
/// 日志系统初始化前调用，只解析 `[log]` 段，失败时返回默认配置
async fn load_log_config(config_path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(config_path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // 先加载日志配置（必须保持 _log_guard 存活）
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("datahub-sync v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;

    let store = Arc::new(DirectoryProductStore::new(&config.storage.product_dir));
    store.ensure_root().await?;

    let registry = Arc::new(ConfigurationRegistry::load(Box::new(JsonFileStore::new(
        &config.registry.path,
    )))?);
    let executor = Arc::new(SchedulingExecutor::new(config.executor.tick_interval()));
    let factory = Arc::new(DirectorySynchronizerFactory::new(
        store,
        config.transfer.chunk_size_bytes(),
    ));

    let manager = SynchronizerManager::new(registry, executor.clone(), factory);
    let loaded = manager.load_all();
    if loaded == 0 {
        warn!("没有可用的同步器配置: {:?}", config.registry.path);
    }

    manager.start(config.executor.batch_mode);
    info!(
        "同步执行器已启动: {} 个同步器, 批处理模式={}",
        loaded, config.executor.batch_mode
    );

    tokio::select! {
        _ = executor.wait_until_stopped() => {
            info!("所有同步器已完成工作");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，等待在途同步结束（再次 Ctrl+C 强制终止）...");
            manager.stop();

            tokio::select! {
                _ = executor.wait_until_stopped() => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("再次收到 Ctrl+C，取消在途同步");
                    manager.terminate();
                    executor.wait_until_stopped().await;
                }
            }
        }
    }

    info!("应用已安全退出");
    Ok(())
}
