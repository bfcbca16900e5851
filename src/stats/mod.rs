//! 聚合引擎
//!
//! 每次调用都从完整记录集重新计算，结果与记录顺序无关。

pub mod accumulator;
pub mod scenario;
pub mod summary;
pub mod types;

pub use accumulator::round2;
pub use scenario::scenario_comparison;
pub use summary::dashboard_stats;
pub use types::{DashboardStats, ScenarioComparison};
