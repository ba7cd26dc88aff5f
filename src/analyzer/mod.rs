// Analyzer module: per-combination trends and cross-market insights.

pub mod insights;
pub mod stats;
pub mod trend;

pub use insights::{rank_by_confidence, InsightGenerator};
pub use trend::TrendAnalyzer;
