//! 带宽计算器
//!
//! 固定容量的字节数样本窗口。窗口填满之前无法给出有效值；
//! 填满之后窗口冻结，后续样本被丢弃，报告值保持为填满时的字节总数（不是字节/秒）

/// 默认窗口容量（样本数）
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// 窗口未填满时返回的哨兵值
pub const UNKNOWN_BANDWIDTH: i64 = -1;

/// 单个传输的带宽计算器
#[derive(Debug, Clone)]
pub struct BandwidthCalculator {
    /// 计算器 ID（由调用方提供）
    id: String,
    /// 已记录的样本，长度不超过 `capacity`
    samples: Vec<u64>,
    capacity: usize,
}

impl BandwidthCalculator {
    /// 创建默认容量的计算器
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_capacity(id, DEFAULT_WINDOW_CAPACITY)
    }

    /// 创建指定容量的计算器，容量至少为 1
    pub fn with_capacity(id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            id: id.into(),
            samples: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 记录一个样本，窗口已满时丢弃
    pub fn add_sample(&mut self, bytes: u64) {
        if self.samples.len() < self.capacity {
            self.samples.push(bytes);
        }
    }

    /// 窗口是否已填满
    pub fn is_filled(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// 已记录的样本数
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 计算窗口带宽
    ///
    /// # 返回
    /// - 窗口未满：`UNKNOWN_BANDWIDTH`（-1）
    /// - 窗口已满：窗口内样本字节总数（饱和到 `i64::MAX`）
    pub fn bandwidth(&self) -> i64 {
        if !self.is_filled() {
            return UNKNOWN_BANDWIDTH;
        }
        let total = self
            .samples
            .iter()
            .fold(0u64, |sum, bytes| sum.saturating_add(*bytes));
        i64::try_from(total).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_until_filled() {
        let mut calc = BandwidthCalculator::new("t1");
        for _ in 0..99 {
            calc.add_sample(1024);
            assert_eq!(calc.bandwidth(), UNKNOWN_BANDWIDTH);
        }
        calc.add_sample(1024);
        assert!(calc.is_filled());
        assert_eq!(calc.bandwidth(), 102_400);
    }

    #[test]
    fn test_window_freezes_once_filled() {
        let mut calc = BandwidthCalculator::with_capacity("t1", 4);
        for bytes in [1, 2, 3, 4] {
            calc.add_sample(bytes);
        }
        assert_eq!(calc.bandwidth(), 10);

        // 填满后的样本不改变报告值
        calc.add_sample(10);
        calc.add_sample(0);
        assert_eq!(calc.bandwidth(), 10);
        assert_eq!(calc.sample_count(), 4);
    }

    #[test]
    fn test_total_saturates() {
        let mut calc = BandwidthCalculator::with_capacity("t1", 3);
        for _ in 0..3 {
            calc.add_sample(u64::MAX);
        }
        assert_eq!(calc.bandwidth(), i64::MAX);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut calc = BandwidthCalculator::with_capacity("t1", 0);
        assert_eq!(calc.capacity(), 1);
        calc.add_sample(7);
        assert_eq!(calc.bandwidth(), 7);
    }
}
