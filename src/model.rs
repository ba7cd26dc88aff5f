// Core structs: observations, reference entities, analyses, insights and errors
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const BASE_CURRENCY: &str = "USD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    Excellent,
    Good,
    Fair,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Excellent => "excellent",
            Condition::Good => "good",
            Condition::Fair => "fair",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Condition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "excellent" => Ok(Condition::Excellent),
            "good" => Ok(Condition::Good),
            "fair" => Ok(Condition::Fair),
            other => Err(format!("unknown condition grade '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductVariant {
    pub id: i64,
    pub brand: String,
    pub model_name: String,
    pub storage: String,
    pub is_active: bool,
}

impl ProductVariant {
    /// "Brand Model Storage", as shown in insight titles.
    pub fn label(&self) -> String {
        format!("{} {} {}", self.brand, self.model_name, self.storage)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marketplace {
    pub id: i64,
    pub name: String,
    pub region: String,
    pub base_url: String,
    pub is_active: bool,
}

/// A single price fact collected from a marketplace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceObservation {
    /// Assigned by storage; `None` until persisted.
    pub id: Option<i64>,
    pub variant_id: i64,
    pub marketplace_id: i64,
    pub condition: Condition,
    pub price: f64,
    pub currency: String,
    /// Filled once by the normalizer, never recomputed.
    pub price_usd: Option<f64>,
    pub available: bool,
    pub stock_count: Option<u32>,
    pub product_url: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeRateEntry {
    pub from_currency: String,
    pub to_currency: String,
    pub rate: f64,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Up => "up",
            TrendDirection::Down => "down",
            TrendDirection::Stable => "stable",
        }
    }
}

/// Trend view over a sliding window for one (variant, marketplace, condition).
#[derive(Debug, Clone, Serialize)]
pub struct TrendAnalysis {
    pub variant: ProductVariant,
    pub marketplace: Marketplace,
    pub condition: Condition,

    pub current_price: f64,
    pub previous_price: Option<f64>,
    pub price_change_amount: f64,
    pub price_change_percent: f64,

    pub avg_price_7d: f64,
    pub avg_price_30d: f64,
    pub min_price_7d: f64,
    pub max_price_7d: f64,
    pub volatility: f64,

    pub trend_direction: TrendDirection,
    pub confidence_score: f64,

    pub observation_count: usize,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendPeriod {
    Weekly,
    Monthly,
}

impl TrendPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendPeriod::Weekly => "weekly",
            TrendPeriod::Monthly => "monthly",
        }
    }

    pub fn lookback_days(&self) -> i64 {
        match self {
            TrendPeriod::Weekly => 7,
            TrendPeriod::Monthly => 30,
        }
    }
}

impl FromStr for TrendPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weekly" => Ok(TrendPeriod::Weekly),
            "monthly" => Ok(TrendPeriod::Monthly),
            other => Err(format!("unknown trend period '{}'", other)),
        }
    }
}

/// Persisted form of a [`TrendAnalysis`], written by the periodic snapshot job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendSnapshot {
    pub variant_id: i64,
    pub marketplace_id: i64,
    pub condition: Condition,
    pub period: TrendPeriod,
    pub taken_at: DateTime<Utc>,
    pub current_price_usd: f64,
    pub previous_price_usd: Option<f64>,
    pub price_change_amount: f64,
    pub price_change_percent: f64,
    pub avg_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    pub volatility: f64,
}

impl TrendSnapshot {
    pub fn from_analysis(analysis: &TrendAnalysis, period: TrendPeriod, taken_at: DateTime<Utc>) -> Self {
        Self {
            variant_id: analysis.variant.id,
            marketplace_id: analysis.marketplace.id,
            condition: analysis.condition,
            period,
            taken_at,
            current_price_usd: analysis.current_price,
            previous_price_usd: analysis.previous_price,
            price_change_amount: analysis.price_change_amount,
            price_change_percent: analysis.price_change_percent,
            avg_price: analysis.avg_price_7d,
            min_price: analysis.min_price_7d,
            max_price: analysis.max_price_7d,
            volatility: analysis.volatility,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Arbitrage,
    PriceDrop,
    PriceIncrease,
    BestDeal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketInsight {
    pub kind: InsightKind,
    pub title: String,
    pub description: String,
    pub variant: String,
    pub marketplace: String,
    pub region: String,
    /// Percentage for arbitrage and price changes, USD price for best deals.
    pub value: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularVariant {
    pub brand: String,
    pub model_name: String,
    pub storage: String,
    pub observation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSummary {
    pub total_observations: usize,
    pub recent_observations: usize,
    pub brand_avg_prices: BTreeMap<String, f64>,
    pub popular_variants: Vec<PopularVariant>,
    pub marketplace_activity: Vec<(String, usize)>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid stored value: {0}")]
    InvalidData(String),
    #[error("storage connection lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("provider requires an API key")]
    MissingKey,
    #[error("provider timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unknown product variant id {0}")]
    UnknownVariant(i64),
    #[error("unknown marketplace id {0}")]
    UnknownMarketplace(i64),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
