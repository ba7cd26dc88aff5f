//! Price intelligence for secondary-market electronics: currency normalization,
//! per-listing trend analysis and ranked market insights.

pub mod analyzer;
pub mod config;
pub mod currency;
pub mod model;
pub mod normalizer;
pub mod storage;
pub mod utils;
