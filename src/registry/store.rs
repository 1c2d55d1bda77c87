//! 配置存储后端

use crate::synchronizer::TaskConfiguration;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// 配置存储后端
///
/// 注册表在持有写锁时同步调用 `save`，实现应尽量快速返回
pub trait ConfigurationStore: Send + Sync {
    /// 加载全部配置
    fn load(&self) -> Result<Vec<TaskConfiguration>>;

    /// 保存全部配置（整体覆盖）
    fn save(&self, configurations: &[TaskConfiguration]) -> Result<()>;
}

/// JSON 文件存储
///
/// 文件不存在视为空配置；保存时先写临时文件再原子重命名
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigurationStore for JsonFileStore {
    fn load(&self) -> Result<Vec<TaskConfiguration>> {
        if !self.path.exists() {
            info!("同步器配置文件不存在，使用空配置: {:?}", self.path);
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("读取同步器配置文件失败: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content)
            .with_context(|| format!("解析同步器配置文件失败: {:?}", self.path))
    }

    fn save(&self, configurations: &[TaskConfiguration]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content =
            serde_json::to_string_pretty(configurations).context("序列化同步器配置失败")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("写入临时配置文件失败: {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("替换同步器配置文件失败: {:?}", self.path))?;

        debug!("已保存 {} 个同步器配置到 {:?}", configurations.len(), self.path);
        Ok(())
    }
}
