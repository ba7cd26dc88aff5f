use crate::model::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    ExchangerateApi,
    Fixer,
    ExchangerateHost,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CurrencyConfig {
    pub cache_hours: i64,
    pub provider_timeout_seconds: u64,
    /// Tried in order; the first provider returning a usable rate wins.
    pub providers: Vec<ProviderKind>,
    pub fixer_api_key: Option<String>,
    /// Units of currency per one USD.
    pub fallback_rates: BTreeMap<String, f64>,
    pub tracked_currencies: Vec<String>,
}

impl Default for CurrencyConfig {
    fn default() -> Self {
        let fallback_rates = [
            ("USD", 1.0),
            ("EUR", 0.85),
            ("GBP", 0.73),
            ("JPY", 110.0),
            ("INR", 75.0),
            ("CAD", 1.25),
            ("AUD", 1.35),
        ]
        .into_iter()
        .map(|(code, rate)| (code.to_string(), rate))
        .collect();

        Self {
            cache_hours: 24,
            provider_timeout_seconds: 10,
            providers: vec![
                ProviderKind::ExchangerateApi,
                ProviderKind::Fixer,
                ProviderKind::ExchangerateHost,
            ],
            fixer_api_key: None,
            fallback_rates,
            tracked_currencies: ["EUR", "GBP", "JPY", "INR", "CAD", "AUD"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub lookback_days: i64,
    pub short_window_days: i64,
    pub long_window_days: i64,
    /// Percent-per-step slope beyond which a trend counts as up or down.
    pub trend_threshold_percent: f64,
    pub insufficient_data_confidence: f64,
    pub density_target_points: f64,
    pub span_target_days: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            short_window_days: 7,
            long_window_days: 30,
            trend_threshold_percent: 0.5,
            insufficient_data_confidence: 0.3,
            density_target_points: 20.0,
            span_target_days: 30.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InsightConfig {
    pub arbitrage_min_profit_percent: f64,
    pub significant_change_percent: f64,
    pub best_deals_top_n: usize,
    pub arbitrage_confidence: f64,
    pub significant_change_confidence: f64,
    pub best_deal_confidence: f64,
    pub best_deal_recency_days: i64,
    pub best_deal_average_days: i64,
    pub summary_window_days: i64,
    pub popular_variants_limit: usize,
    pub snapshot_lookback_days: i64,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            arbitrage_min_profit_percent: 10.0,
            significant_change_percent: 10.0,
            best_deals_top_n: 10,
            arbitrage_confidence: 0.8,
            significant_change_confidence: 0.9,
            best_deal_confidence: 0.7,
            best_deal_recency_days: 3,
            best_deal_average_days: 30,
            summary_window_days: 7,
            popular_variants_limit: 5,
            snapshot_lookback_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: String,
    pub check_interval_seconds: u64,
    pub retention_days: i64,
    pub currency: CurrencyConfig,
    pub analysis: AnalysisConfig,
    pub insights: InsightConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "data.db".to_string(),
            check_interval_seconds: 3600,
            retention_days: 90,
            currency: CurrencyConfig::default(),
            analysis: AnalysisConfig::default(),
            insights: InsightConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let confidences = [
            ("arbitrage_confidence", self.insights.arbitrage_confidence),
            ("significant_change_confidence", self.insights.significant_change_confidence),
            ("best_deal_confidence", self.insights.best_deal_confidence),
            ("insufficient_data_confidence", self.analysis.insufficient_data_confidence),
        ];
        for (name, value) in confidences {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }

        for (code, rate) in &self.currency.fallback_rates {
            if !rate.is_finite() || *rate <= 0.0 {
                return Err(ConfigError::Invalid(format!("fallback rate for {} must be positive", code)));
            }
        }

        let windows = [
            ("cache_hours", self.currency.cache_hours),
            ("lookback_days", self.analysis.lookback_days),
            ("short_window_days", self.analysis.short_window_days),
            ("long_window_days", self.analysis.long_window_days),
            ("best_deal_recency_days", self.insights.best_deal_recency_days),
            ("best_deal_average_days", self.insights.best_deal_average_days),
            ("summary_window_days", self.insights.summary_window_days),
            ("snapshot_lookback_days", self.insights.snapshot_lookback_days),
            ("retention_days", self.retention_days),
        ];
        for (name, value) in windows {
            if value <= 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        if self.analysis.density_target_points <= 0.0 || self.analysis.span_target_days <= 0.0 {
            return Err(ConfigError::Invalid("confidence targets must be positive".into()));
        }

        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
