//! 带宽统计模块
//!
//! 为每个数据源提供样本窗口式的吞吐量估算和并发传输计数，
//! 供同步任务做限流决策

mod calculator;
mod tracker;

pub use calculator::{BandwidthCalculator, DEFAULT_WINDOW_CAPACITY, UNKNOWN_BANDWIDTH};
pub use tracker::{BandwidthTracker, CalculatorGuard};
