//! 目录数据源

use crate::synchronizer::{ProductCursor, ProductSource, ProductTransfer, RemoteProduct};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// 目录数据源
///
/// 根目录下的每个普通文件是一个产品，产品 ID 为相对路径，
/// 创建时间取文件修改时间
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
    name: String,
    chunk_size: usize,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, chunk_size: usize) -> Self {
        let root = root.into();
        Self {
            name: root.display().to_string(),
            root,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 同步扫描目录
    fn scan(root: &Path, after: Option<&ProductCursor>) -> Vec<RemoteProduct> {
        walkdir::WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let modified: DateTime<Utc> = metadata.modified().ok()?.into();
                let relative = entry.path().strip_prefix(root).ok()?;
                let id = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                Some(RemoteProduct {
                    id,
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: metadata.len(),
                    creation_date: modified,
                })
            })
            .filter(|product| after.map_or(true, |after| product.cursor() > *after))
            .collect()
    }
}

#[async_trait]
impl ProductSource for DirectorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_products(
        &self,
        after: Option<&ProductCursor>,
        limit: usize,
    ) -> Result<Vec<RemoteProduct>> {
        let root = self.root.clone();
        let after = after.cloned();
        let mut products = tokio::task::spawn_blocking(move || Self::scan(&root, after.as_ref()))
            .await
            .map_err(|e| anyhow::anyhow!("扫描数据源目录失败: {}", e))?;

        products.sort_by_key(RemoteProduct::cursor);
        products.truncate(limit);
        Ok(products)
    }

    async fn open(&self, product: &RemoteProduct) -> Result<Box<dyn ProductTransfer>> {
        let path = self.root.join(&product.id);
        let file = File::open(&path)
            .await
            .with_context(|| format!("打开产品文件失败: {:?}", path))?;
        Ok(Box::new(FileTransfer {
            file,
            buffer: vec![0; self.chunk_size],
        }))
    }
}

/// 文件分块读取
struct FileTransfer {
    file: File,
    buffer: Vec<u8>,
}

#[async_trait]
impl ProductTransfer for FileTransfer {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let read = self
            .file
            .read(&mut self.buffer)
            .await
            .context("读取产品文件失败")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(self.buffer.get(..read).map(|chunk| chunk.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_list_and_read_products() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("tiles")).unwrap();
        fs::write(dir.path().join("a.zip"), vec![1u8; 10]).unwrap();
        fs::write(dir.path().join("tiles").join("b.zip"), vec![2u8; 25]).unwrap();

        let source = DirectorySource::new(dir.path(), 8);
        let products = source.list_products(None, 10).await.unwrap();
        assert_eq!(products.len(), 2);

        let nested = products.iter().find(|p| p.name == "b.zip").unwrap();
        assert_eq!(nested.id, "tiles/b.zip");
        assert_eq!(nested.size, 25);

        let mut transfer = source.open(nested).await.unwrap();
        let mut chunks = vec![];
        while let Some(chunk) = transfer.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 8);
            chunks.extend(chunk);
        }
        assert_eq!(chunks, vec![2u8; 25]);
    }

    #[tokio::test]
    async fn test_list_respects_limit_and_cursor() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("p{}.zip", i)), b"x").unwrap();
        }

        let source = DirectorySource::new(dir.path(), 8);
        let limited = source.list_products(None, 3).await.unwrap();
        assert_eq!(limited.len(), 3);

        let future = ProductCursor {
            creation_date: Utc::now() + chrono::Duration::days(1),
            id: String::new(),
        };
        assert!(source.list_products(Some(&future), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_is_exclusive_within_same_timestamp() {
        let dir = tempdir().unwrap();
        let stamp = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        for name in ["a.zip", "b.zip", "c.zip"] {
            let path = dir.path().join(name);
            fs::write(&path, b"x").unwrap();
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(stamp)
                .unwrap();
        }

        let source = DirectorySource::new(dir.path(), 8);
        let first = source.list_products(None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a.zip", "b.zip"]);

        let cursor = first[1].cursor();
        let rest = source.list_products(Some(&cursor), 2).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["c.zip"]);
    }

    #[tokio::test]
    async fn test_open_missing_product_fails() {
        let dir = tempdir().unwrap();
        let source = DirectorySource::new(dir.path(), 8);
        let product = RemoteProduct {
            id: "missing.zip".to_string(),
            name: "missing.zip".to_string(),
            size: 0,
            creation_date: Utc::now(),
        };
        assert!(source.open(&product).await.is_err());
    }
}
