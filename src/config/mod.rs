// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::synchronizer::DEFAULT_TICK_INTERVAL;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 调度执行器配置
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// 同步器配置注册表
    #[serde(default)]
    pub registry: RegistryConfig,
    /// 产品存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 传输配置
    #[serde(default)]
    pub transfer: TransferConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 调度执行器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// 调度循环最长等待间隔（毫秒）
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 批处理模式：所有任务完成工作后自动退出
    #[serde(default)]
    pub batch_mode: bool,
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            batch_mode: false,
        }
    }
}

impl ExecutorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// 同步器配置注册表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// 同步器配置 JSON 文件
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("config/synchronizers.json")
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

/// 产品存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 产品入库目录，淘汰任务同样作用于该目录
    #[serde(default = "default_product_dir")]
    pub product_dir: PathBuf,
}

fn default_product_dir() -> PathBuf {
    PathBuf::from("data/products")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            product_dir: default_product_dir(),
        }
    }
}

/// 传输配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 单次读取的分块大小（KB），每个分块计为一个带宽样本
    #[serde(default = "default_chunk_size_kb")]
    pub chunk_size_kb: usize,
}

fn default_chunk_size_kb() -> usize {
    64
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_kb: default_chunk_size_kb(),
        }
    }
}

impl TransferConfig {
    pub fn chunk_size_bytes(&self) -> usize {
        self.chunk_size_kb.max(1) * 1024
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件验证失败")?;

        Ok(config)
    }

    /// 校验取值范围
    pub fn validate(&self) -> Result<()> {
        if self.executor.tick_interval_ms == 0 {
            anyhow::bail!("executor.tick_interval_ms 必须大于 0");
        }
        if self.transfer.chunk_size_kb == 0 {
            anyhow::bail!("transfer.chunk_size_kb 必须大于 0");
        }
        if self.registry.path.as_os_str().is_empty() {
            anyhow::bail!("registry.path 不能为空");
        }
        if self.storage.product_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.product_dir 不能为空");
        }
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 仅在文件不存在时写出默认配置，避免覆盖格式错误的用户配置
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.executor.tick_interval(), Duration::from_secs(1));
        assert!(!config.executor.batch_mode);
        assert_eq!(config.transfer.chunk_size_bytes(), 64 * 1024);
        assert_eq!(config.registry.path, PathBuf::from("config/synchronizers.json"));
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.executor.batch_mode = true;
        config.storage.product_dir = PathBuf::from("/srv/products");
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [executor]
            batch_mode = true

            [log]
            level = "debug"
            "#,
        )
        .unwrap();

        assert!(config.executor.batch_mode);
        assert_eq!(config.executor.tick_interval_ms, 1000);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.retention_days, 7);
        assert_eq!(config.storage.product_dir, PathBuf::from("data/products"));
    }

    #[tokio::test]
    async fn test_invalid_values_are_rejected() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[transfer]\nchunk_size_kb = 0\n").unwrap();

        let path = temp_file.path().to_str().unwrap();
        assert!(AppConfig::load_from_file(path).await.is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config, AppConfig::default());
        assert!(std::path::Path::new(path).exists());
    }
}
