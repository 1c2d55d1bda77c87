//! 目录产品存储

use crate::synchronizer::{
    EvictionTrigger, ProductStore, RemoteProduct, SyncContext, SyncError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// 写入中的临时文件后缀
const PARTIAL_SUFFIX: &str = ".part";

/// 目录产品存储
///
/// 产品以数据源相对路径保存在根目录下，写入先落到 `.part` 临时文件再重命名
#[derive(Debug, Clone)]
pub struct DirectoryProductStore {
    root: PathBuf,
}

impl DirectoryProductStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 确保根目录存在
    pub async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("创建产品目录失败: {:?}", self.root))
    }

    /// 产品的本地路径，拒绝跳出根目录的 ID
    fn product_path(&self, product: &RemoteProduct) -> Result<PathBuf> {
        let relative = Path::new(&product.id);
        let escapes = relative.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        });
        if escapes || product.id.is_empty() {
            anyhow::bail!("非法的产品 ID: {}", product.id);
        }
        Ok(self.root.join(relative))
    }

    /// 删除修改时间早于 `cutoff` 的产品文件
    fn evict_older_than(root: &Path, cutoff: SystemTime, ctx: &SyncContext) -> Result<usize, SyncError> {
        let mut evicted = 0;

        for entry in walkdir::WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
        {
            ctx.check_cancelled()?;

            let path = entry.path();
            if path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX))
            {
                continue;
            }

            let expired = entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .is_some_and(|modified| modified < cutoff);
            if !expired {
                continue;
            }

            match fs::remove_file(path) {
                Ok(()) => {
                    evicted += 1;
                    debug!("已淘汰产品文件: {:?}", path);
                }
                Err(e) => warn!("淘汰产品文件失败: {:?}, 错误: {}", path, e),
            }
        }

        Ok(evicted)
    }
}

#[async_trait]
impl ProductStore for DirectoryProductStore {
    async fn contains(&self, product: &RemoteProduct) -> Result<bool> {
        let path = self.product_path(product)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("检查产品文件失败: {:?}", path))
    }

    async fn ingest(&self, product: &RemoteProduct, payload: Vec<u8>) -> Result<()> {
        let path = self.product_path(product)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建产品目录失败: {:?}", parent))?;
        }

        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, payload)
            .await
            .with_context(|| format!("写入产品文件失败: {:?}", partial))?;
        tokio::fs::rename(&partial, &path)
            .await
            .with_context(|| format!("重命名产品文件失败: {:?}", path))?;

        debug!("产品已入库: {:?}", path);
        Ok(())
    }
}

#[async_trait]
impl EvictionTrigger for DirectoryProductStore {
    async fn evict(&self, retention: chrono::Duration, ctx: &SyncContext) -> Result<usize, SyncError> {
        ctx.check_cancelled()?;

        let retention = retention
            .to_std()
            .map_err(|e| SyncError::Task(anyhow::anyhow!("保留期限无效: {}", e)))?;
        let cutoff = SystemTime::now()
            .checked_sub(retention)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let root = self.root.clone();
        let ctx = ctx.clone();
        let evicted = tokio::task::spawn_blocking(move || Self::evict_older_than(&root, cutoff, &ctx))
            .await
            .map_err(|e| SyncError::Task(anyhow::anyhow!("淘汰任务异常退出: {}", e)))??;

        if evicted > 0 {
            info!("已从 {:?} 淘汰 {} 个产品文件", self.root, evicted);
        }
        Ok(evicted)
    }
}
