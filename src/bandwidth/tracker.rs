//! 数据源带宽追踪器
//!
//! 每个数据源一个实例。计算器映射由传输方写入、状态查询方并发读取，
//! 使用 DashMap 分片锁，允许并发写样本与删除

use super::calculator::{BandwidthCalculator, DEFAULT_WINDOW_CAPACITY, UNKNOWN_BANDWIDTH};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// 带宽追踪器
#[derive(Debug)]
pub struct BandwidthTracker {
    /// 数据源名称（仅用于日志）
    source: String,
    /// 计算器 ID -> 计算器
    calculators: DashMap<String, BandwidthCalculator>,
    /// 新建计算器的窗口容量
    window_capacity: usize,
}

impl BandwidthTracker {
    /// 创建默认窗口容量的追踪器
    pub fn new(source: impl Into<String>) -> Self {
        Self::with_capacity(source, DEFAULT_WINDOW_CAPACITY)
    }

    pub fn with_capacity(source: impl Into<String>, window_capacity: usize) -> Self {
        Self {
            source: source.into(),
            calculators: DashMap::new(),
            window_capacity,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// 创建新的空窗口
    ///
    /// # 返回
    /// - `true`: 创建成功
    /// - `false`: ID 已存在，不做任何修改
    pub fn generate_bandwidth_calculator(&self, id: &str) -> bool {
        match self.calculators.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(BandwidthCalculator::with_capacity(id, self.window_capacity));
                debug!("[{}] 创建带宽计算器: {}", self.source, id);
                true
            }
        }
    }

    /// 向窗口追加一个样本
    ///
    /// 计算器已被移除时静默忽略：在途传输可能尚未察觉移除
    pub fn populate_bandwidth_calculator(&self, id: &str, bytes: u64) {
        if let Some(mut calc) = self.calculators.get_mut(id) {
            calc.add_sample(bytes);
        }
    }

    /// 获取单个计算器的窗口带宽，未知或不存在时返回 -1
    pub fn calculated_bandwidth(&self, id: &str) -> i64 {
        self.calculators
            .get(id)
            .map(|calc| calc.bandwidth())
            .unwrap_or(UNKNOWN_BANDWIDTH)
    }

    /// 移除计算器，并发下载数立即减少
    pub fn remove_bandwidth_calculator(&self, id: &str) {
        if self.calculators.remove(id).is_some() {
            debug!("[{}] 移除带宽计算器: {}", self.source, id);
        }
    }

    /// 当前并发传输数（已注册且未移除的计算器数量）
    pub fn concurrent_download(&self) -> usize {
        self.calculators.len()
    }

    /// 数据源总带宽
    ///
    /// 没有任何窗口填满时返回 -1，否则为所有已填满窗口的带宽之和
    pub fn bandwidth(&self) -> i64 {
        self.calculators
            .iter()
            .map(|calc| calc.bandwidth())
            .filter(|&value| value != UNKNOWN_BANDWIDTH)
            .fold(None, |acc: Option<i64>, value| {
                Some(acc.map_or(value, |sum| sum.saturating_add(value)))
            })
            .unwrap_or(UNKNOWN_BANDWIDTH)
    }

    /// 注册计算器并返回 RAII 守卫，守卫被 drop 时自动移除计算器
    ///
    /// ID 已存在时返回 `None`
    pub fn track(self: &Arc<Self>, id: &str) -> Option<CalculatorGuard> {
        if !self.generate_bandwidth_calculator(id) {
            return None;
        }
        Some(CalculatorGuard {
            tracker: Arc::clone(self),
            id: id.to_string(),
        })
    }
}

/// 计算器守卫（RAII）
///
/// 传输结束、失败或被取消时都会移除对应计算器
#[derive(Debug)]
pub struct CalculatorGuard {
    tracker: Arc<BandwidthTracker>,
    id: String,
}

impl CalculatorGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// 记录一个样本
    pub fn record(&self, bytes: u64) {
        self.tracker.populate_bandwidth_calculator(&self.id, bytes);
    }

    pub fn bandwidth(&self) -> i64 {
        self.tracker.calculated_bandwidth(&self.id)
    }
}

impl Drop for CalculatorGuard {
    fn drop(&mut self) {
        self.tracker.remove_bandwidth_calculator(&self.id);
    }
}
