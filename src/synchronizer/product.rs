//! 产品同步器
//!
//! 每轮从数据源分页拉取新产品，并发传输到本地存储，
//! 传输过程中向数据源的带宽追踪器上报样本

use super::configuration::{ConfigurationHandle, TaskKind};
use super::error::SyncError;
use super::task::{SyncContext, SynchronizationTask};
use crate::bandwidth::{BandwidthTracker, CalculatorGuard};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 预分配缓冲区的上限，避免超大产品一次性申请内存
const MAX_PREALLOCATE: usize = 16 * 1024 * 1024;

/// 数据源上的产品描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProduct {
    /// 数据源内唯一标识
    pub id: String,
    pub name: String,
    /// 字节数
    pub size: u64,
    /// 数据源上的创建时间，用作同步游标
    pub creation_date: DateTime<Utc>,
}

impl RemoteProduct {
    /// 该产品在数据源列出顺序中的位置
    pub fn cursor(&self) -> ProductCursor {
        ProductCursor {
            creation_date: self.creation_date,
            id: self.id.clone(),
        }
    }
}

/// 同步游标
///
/// 按 (创建时间, 产品 ID) 排序，同一时间戳下的多个产品也能逐页推进
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductCursor {
    pub creation_date: DateTime<Utc>,
    pub id: String,
}

/// 产品数据源
#[async_trait]
pub trait ProductSource: Send + Sync {
    /// 数据源名称
    fn name(&self) -> &str;

    /// 列出严格位于游标 `after` 之后的产品，按 (创建时间, ID) 升序，最多 `limit` 个
    async fn list_products(
        &self,
        after: Option<&ProductCursor>,
        limit: usize,
    ) -> anyhow::Result<Vec<RemoteProduct>>;

    /// 打开一个产品的传输
    async fn open(&self, product: &RemoteProduct) -> anyhow::Result<Box<dyn ProductTransfer>>;
}

/// 单个产品的分块传输
#[async_trait]
pub trait ProductTransfer: Send {
    /// 读取下一块数据，传输结束时返回 `None`
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

/// 本地产品存储
#[async_trait]
pub trait ProductStore: Send + Sync {
    async fn contains(&self, product: &RemoteProduct) -> anyhow::Result<bool>;

    async fn ingest(&self, product: &RemoteProduct, payload: Vec<u8>) -> anyhow::Result<()>;
}

/// 一页产品的处理进度
#[derive(Default)]
struct PageProgress {
    ingested: usize,
    bytes: u64,
    failed: Vec<(ProductCursor, String)>,
}

impl PageProgress {
    fn record(
        &mut self,
        product: RemoteProduct,
        result: Result<u64, SyncError>,
    ) -> Result<(), SyncError> {
        match result {
            Ok(bytes) => {
                self.ingested += 1;
                self.bytes += bytes;
                info!("✓ 产品已同步: {} ({} 字节)", product.name, bytes);
                Ok(())
            }
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                warn!("产品同步失败: {}, 错误: {}", product.name, e);
                self.failed
                    .push((product.cursor(), format!("{}: {}", product.name, e)));
                Ok(())
            }
        }
    }
}

/// 产品同步器
pub struct ProductSynchronizer {
    handle: ConfigurationHandle,
    source: Arc<dyn ProductSource>,
    store: Arc<dyn ProductStore>,
    tracker: Arc<BandwidthTracker>,
    /// 最后一个已处理产品的位置
    cursor: Mutex<Option<ProductCursor>>,
}

impl ProductSynchronizer {
    pub fn new(
        handle: ConfigurationHandle,
        source: Arc<dyn ProductSource>,
        store: Arc<dyn ProductStore>,
    ) -> Self {
        let tracker = Arc::new(BandwidthTracker::new(source.name()));
        Self {
            handle,
            source,
            store,
            tracker,
            cursor: Mutex::new(None),
        }
    }

    /// 数据源带宽追踪器
    pub fn tracker(&self) -> Arc<BandwidthTracker> {
        self.tracker.clone()
    }

    pub fn cursor(&self) -> Option<ProductCursor> {
        self.cursor.lock().clone()
    }

    /// 读取当前配置中的分页大小和最大并发传输数
    fn settings(&self) -> Result<(usize, usize), SyncError> {
        match self.handle.snapshot().kind {
            TaskKind::Product {
                page_size,
                max_concurrent_transfers,
                ..
            } => Ok((page_size.max(1), max_concurrent_transfers.max(1))),
            other => Err(SyncError::Task(anyhow!(
                "产品同步器 {} 的配置类型不匹配: {}",
                self.handle.id(),
                other.name()
            ))),
        }
    }

    async fn transfer(
        &self,
        product: RemoteProduct,
        guard: CalculatorGuard,
        ctx: &SyncContext,
    ) -> (RemoteProduct, Result<u64, SyncError>) {
        let result = self.run_transfer(&product, &guard, ctx).await;
        // 传输结束，并发计数立即减少
        drop(guard);
        (product, result)
    }

    async fn run_transfer(
        &self,
        product: &RemoteProduct,
        guard: &CalculatorGuard,
        ctx: &SyncContext,
    ) -> Result<u64, SyncError> {
        let mut transfer = self.source.open(product).await?;
        let capacity = usize::try_from(product.size)
            .unwrap_or(MAX_PREALLOCATE)
            .min(MAX_PREALLOCATE);
        let mut payload = Vec::with_capacity(capacity);

        loop {
            ctx.check_cancelled()?;
            let chunk = tokio::select! {
                chunk = transfer.next_chunk() => chunk?,
                _ = ctx.cancelled() => return Err(SyncError::Cancelled),
            };
            let Some(chunk) = chunk else {
                break;
            };
            guard.record(chunk.len() as u64);
            payload.extend_from_slice(&chunk);
        }

        ctx.check_cancelled()?;
        let bytes = payload.len() as u64;
        debug!(
            "传输完成: {}, 窗口带宽={}",
            product.name,
            guard.bandwidth()
        );
        self.store.ingest(product, payload).await?;
        Ok(bytes)
    }
}

#[async_trait]
impl SynchronizationTask for ProductSynchronizer {
    fn handle(&self) -> &ConfigurationHandle {
        &self.handle
    }

    async fn synchronize(&self, ctx: &SyncContext) -> Result<bool, SyncError> {
        ctx.check_cancelled()?;
        let (page_size, max_transfers) = self.settings()?;
        let cursor = self.cursor();

        let products = tokio::select! {
            products = self.source.list_products(cursor.as_ref(), page_size) => products?,
            _ = ctx.cancelled() => return Err(SyncError::Cancelled),
        };
        if products.is_empty() {
            debug!("[{}] 没有新产品", self.source.name());
            return Ok(false);
        }

        let mut progress = PageProgress::default();
        let mut listed: Vec<ProductCursor> = products.iter().map(RemoteProduct::cursor).collect();
        listed.sort();
        let mut transfers = FuturesUnordered::new();

        for product in products {
            ctx.check_cancelled()?;

            if self.store.contains(&product).await? {
                debug!("产品已存在，跳过: {}", product.name);
                continue;
            }

            // 限流：并发传输数达到上限时先等待一个传输结束
            while self.tracker.concurrent_download() >= max_transfers {
                match transfers.next().await {
                    Some((done, result)) => progress.record(done, result)?,
                    None => break,
                }
            }

            let guard = self
                .tracker
                .track(&Uuid::new_v4().to_string())
                .ok_or_else(|| anyhow!("带宽计算器 ID 冲突"))?;
            transfers.push(self.transfer(product, guard, ctx));
        }

        while let Some((done, result)) = transfers.next().await {
            progress.record(done, result)?;
        }

        // 游标停在最早失败产品之前，下一轮从失败产品开始重新列出；
        // 其后已入库的产品会被 `contains` 跳过
        let earliest_failure = progress.failed.iter().map(|(key, _)| key).min();
        let next_cursor = listed
            .iter()
            .take_while(|key| earliest_failure.map_or(true, |failed| *key < failed))
            .last()
            .cloned()
            .or(cursor);
        *self.cursor.lock() = next_cursor;

        info!(
            "[{}] 本轮同步 {} 个产品, {} 字节, 数据源带宽={}, 并发传输={}",
            self.source.name(),
            progress.ingested,
            progress.bytes,
            self.tracker.bandwidth(),
            self.tracker.concurrent_download()
        );

        if let Some((_, first)) = progress.failed.first() {
            return Err(SyncError::Task(anyhow!(
                "{} 个产品同步失败，首个错误: {}",
                progress.failed.len(),
                first
            )));
        }

        Ok(progress.ingested > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synchronizer::configuration::TaskConfiguration;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct MemorySource {
        products: Vec<(RemoteProduct, Vec<u8>)>,
        chunk_size: usize,
        /// 这些产品的传输会失败
        broken: Vec<String>,
        /// 每块之间的延迟
        delay: Duration,
        max_concurrent: Arc<AtomicUsize>,
        concurrent: Arc<AtomicUsize>,
    }

    impl MemorySource {
        fn new(count: usize, size: usize) -> Self {
            let products = (0..count)
                .map(|i| {
                    let product = RemoteProduct {
                        id: format!("p{}", i),
                        name: format!("S2A_{}.zip", i),
                        size: size as u64,
                        creation_date: Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap(),
                    };
                    (product, vec![i as u8; size])
                })
                .collect();
            Self {
                products,
                chunk_size: 16,
                broken: vec![],
                delay: Duration::ZERO,
                max_concurrent: Arc::new(AtomicUsize::new(0)),
                concurrent: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct MemoryTransfer {
        data: Vec<u8>,
        offset: usize,
        chunk_size: usize,
        broken: bool,
        delay: Duration,
        concurrent: Arc<AtomicUsize>,
    }

    impl Drop for MemoryTransfer {
        fn drop(&mut self) {
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProductTransfer for MemoryTransfer {
        async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.broken && self.offset > 0 {
                anyhow::bail!("connection reset");
            }
            if self.offset >= self.data.len() {
                return Ok(None);
            }
            let end = (self.offset + self.chunk_size).min(self.data.len());
            let chunk = self.data[self.offset..end].to_vec();
            self.offset = end;
            Ok(Some(chunk))
        }
    }

    #[async_trait]
    impl ProductSource for MemorySource {
        fn name(&self) -> &str {
            "memory"
        }

        async fn list_products(
            &self,
            after: Option<&ProductCursor>,
            limit: usize,
        ) -> anyhow::Result<Vec<RemoteProduct>> {
            let mut products: Vec<RemoteProduct> = self
                .products
                .iter()
                .map(|(product, _)| product.clone())
                .filter(|product| after.map_or(true, |after| product.cursor() > *after))
                .collect();
            products.sort_by_key(RemoteProduct::cursor);
            products.truncate(limit);
            Ok(products)
        }

        async fn open(&self, product: &RemoteProduct) -> anyhow::Result<Box<dyn ProductTransfer>> {
            let (_, data) = self
                .products
                .iter()
                .find(|(candidate, _)| candidate.id == product.id)
                .ok_or_else(|| anyhow!("unknown product"))?;
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            Ok(Box::new(MemoryTransfer {
                data: data.clone(),
                offset: 0,
                chunk_size: self.chunk_size,
                broken: self.broken.contains(&product.id),
                delay: self.delay,
                concurrent: self.concurrent.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        products: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ProductStore for MemoryStore {
        async fn contains(&self, product: &RemoteProduct) -> anyhow::Result<bool> {
            Ok(self.products.lock().contains_key(&product.id))
        }

        async fn ingest(&self, product: &RemoteProduct, payload: Vec<u8>) -> anyhow::Result<()> {
            self.products.lock().insert(product.id.clone(), payload);
            Ok(())
        }
    }

    fn synchronizer(
        source: MemorySource,
        store: Arc<MemoryStore>,
        page_size: usize,
        max_concurrent_transfers: usize,
    ) -> ProductSynchronizer {
        let handle = ConfigurationHandle::new(TaskConfiguration {
            id: 1,
            label: "memory".to_string(),
            schedule: "* * * * * *".to_string(),
            active: true,
            kind: TaskKind::Product {
                source: PathBuf::from("/memory"),
                page_size,
                max_concurrent_transfers,
            },
        });
        ProductSynchronizer::new(handle, Arc::new(source), store)
    }

    #[tokio::test]
    async fn test_synchronize_pages_until_done() {
        let store = Arc::new(MemoryStore::default());
        let sync = synchronizer(MemorySource::new(5, 100), store.clone(), 3, 2);
        let ctx = SyncContext::default();

        assert!(sync.synchronize(&ctx).await.unwrap());
        assert_eq!(store.products.lock().len(), 3);

        assert!(sync.synchronize(&ctx).await.unwrap());
        assert_eq!(store.products.lock().len(), 5);
        assert_eq!(store.products.lock()["p4"], vec![4u8; 100]);

        // 游标停在最后一个产品之后，没有新产品
        assert!(!sync.synchronize(&ctx).await.unwrap());
        assert_eq!(sync.tracker().concurrent_download(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_transfers_are_throttled() {
        let store = Arc::new(MemoryStore::default());
        let mut source = MemorySource::new(8, 64);
        source.delay = Duration::from_millis(5);
        let max_concurrent = source.max_concurrent.clone();
        let sync = synchronizer(source, store.clone(), 10, 2);

        assert!(sync.synchronize(&SyncContext::default()).await.unwrap());
        assert_eq!(store.products.lock().len(), 8);
        assert!(max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_transfer_holds_cursor() {
        let store = Arc::new(MemoryStore::default());
        let mut source = MemorySource::new(4, 64);
        source.broken = vec!["p2".to_string()];
        let before_failure = source.products[1].0.cursor();
        let sync = synchronizer(source, store.clone(), 10, 1);

        let result = sync.synchronize(&SyncContext::default()).await;
        assert!(matches!(result, Err(SyncError::Task(_))));
        assert_eq!(store.products.lock().len(), 3);
        assert_eq!(sync.cursor(), Some(before_failure));
        assert_eq!(sync.tracker().concurrent_download(), 0);
    }

    #[tokio::test]
    async fn test_products_sharing_a_timestamp_are_all_synced() {
        let store = Arc::new(MemoryStore::default());
        let mut source = MemorySource::new(3, 32);
        let shared_date = source.products[0].0.creation_date;
        for (product, _) in source.products.iter_mut() {
            product.creation_date = shared_date;
        }
        let sync = synchronizer(source, store.clone(), 2, 1);
        let ctx = SyncContext::default();

        assert!(sync.synchronize(&ctx).await.unwrap());
        assert_eq!(store.products.lock().len(), 2);

        assert!(sync.synchronize(&ctx).await.unwrap());
        assert_eq!(store.products.lock().len(), 3);
        assert!(store.products.lock().contains_key("p2"));

        assert!(!sync.synchronize(&ctx).await.unwrap());
        assert_eq!(
            sync.cursor(),
            Some(ProductCursor {
                creation_date: shared_date,
                id: "p2".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(MemoryStore::default());
        let sync = synchronizer(MemorySource::new(2, 64), store.clone(), 10, 1);
        let token = CancellationToken::new();
        token.cancel();

        let result = sync.synchronize(&SyncContext::new(token)).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(store.products.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_during_transfer() {
        let store = Arc::new(MemoryStore::default());
        let mut source = MemorySource::new(2, 1024);
        source.delay = Duration::from_millis(20);
        let sync = Arc::new(synchronizer(source, store.clone(), 10, 2));
        let token = CancellationToken::new();

        let handle = {
            let sync = sync.clone();
            let ctx = SyncContext::new(token.clone());
            tokio::spawn(async move { sync.synchronize(&ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sync.tracker().concurrent_download(), 2);
        token.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(store.products.lock().is_empty());
        assert_eq!(sync.tracker().concurrent_download(), 0);
    }

    #[tokio::test]
    async fn test_bandwidth_reported_during_transfer() {
        let store = Arc::new(MemoryStore::default());
        // 200 块 * 16 字节，窗口在第 100 块时填满
        let mut source = MemorySource::new(1, 16 * 200);
        source.delay = Duration::from_millis(1);
        let sync = Arc::new(synchronizer(source, store, 10, 1));

        let handle = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.synchronize(&SyncContext::default()).await })
        };

        let tracker = sync.tracker();
        let mut observed = -1;
        for _ in 0..200 {
            observed = observed.max(tracker.bandwidth());
            if observed > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert!(handle.await.unwrap().unwrap());
        assert_eq!(observed, 1600);
    }
}
