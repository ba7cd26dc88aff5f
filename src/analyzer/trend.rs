use crate::analyzer::stats::{linear_slope, mean, min_max, population_std_dev};
use crate::config::AnalysisConfig;
use crate::model::{AnalysisError, Condition, StorageError, TrendAnalysis, TrendDirection};
use crate::storage::ObservationStore;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

const DENSITY_WEIGHT: f64 = 0.4;
const VOLATILITY_WEIGHT: f64 = 0.4;
const SPAN_WEIGHT: f64 = 0.2;
const MIN_CONFIDENCE: f64 = 0.1;
const MIN_REGRESSION_POINTS: usize = 3;

/// Per-combination trend analysis over normalized observations.
pub struct TrendAnalyzer<'a, S: ObservationStore + ?Sized> {
    store: &'a S,
    config: &'a AnalysisConfig,
}

impl<'a, S: ObservationStore + ?Sized> TrendAnalyzer<'a, S> {
    pub fn new(store: &'a S, config: &'a AnalysisConfig) -> Self {
        Self { store, config }
    }

    /// Analyzes one combination as of now. `Ok(None)` means fewer than two usable points.
    pub fn analyze(
        &self,
        variant_id: i64,
        marketplace_id: i64,
        condition: Condition,
        lookback_days: i64,
    ) -> Result<Option<TrendAnalysis>, AnalysisError> {
        self.analyze_at(variant_id, marketplace_id, condition, lookback_days, Utc::now())
    }

    pub fn analyze_at(
        &self,
        variant_id: i64,
        marketplace_id: i64,
        condition: Condition,
        lookback_days: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TrendAnalysis>, AnalysisError> {
        let variant = self
            .store
            .variant(variant_id)?
            .ok_or(AnalysisError::UnknownVariant(variant_id))?;
        let marketplace = self
            .store
            .marketplace(marketplace_id)?
            .ok_or(AnalysisError::UnknownMarketplace(marketplace_id))?;

        let since = now - Duration::days(lookback_days);
        let points: Vec<(DateTime<Utc>, f64)> = self
            .store
            .combination_history(variant_id, marketplace_id, condition, since, now)?
            .into_iter()
            .filter_map(|o| o.price_usd.map(|p| (o.observed_at, p)))
            .collect();

        if points.len() < 2 {
            debug!(
                "Insufficient data for {}/{}/{}: {} points",
                variant_id, marketplace_id, condition, points.len()
            );
            return Ok(None);
        }

        let prices: Vec<f64> = points.iter().map(|(_, p)| *p).collect();
        let current_price = prices[prices.len() - 1];
        let previous_price = Some(prices[prices.len() - 2]);

        let price_change_amount = previous_price.map_or(0.0, |prev| current_price - prev);
        let price_change_percent = match previous_price {
            Some(prev) if prev != 0.0 => price_change_amount / prev * 100.0,
            _ => 0.0,
        };

        let short_window = window_prices(&points, now - Duration::days(self.config.short_window_days));
        let long_window = window_prices(&points, now - Duration::days(self.config.long_window_days));

        let avg_price_7d = mean(&short_window).unwrap_or(current_price);
        let avg_price_30d = mean(&long_window).unwrap_or(current_price);
        let (min_price_7d, max_price_7d) = min_max(&short_window).unwrap_or((current_price, current_price));

        let volatility = population_std_dev(&prices);
        let window_start = points[0].0;
        let window_end = points[points.len() - 1].0;
        let span_days = (window_end - window_start).num_days() as f64;

        Ok(Some(TrendAnalysis {
            variant,
            marketplace,
            condition,
            current_price,
            previous_price,
            price_change_amount,
            price_change_percent,
            avg_price_7d,
            avg_price_30d,
            min_price_7d,
            max_price_7d,
            volatility,
            trend_direction: trend_direction(&prices, self.config.trend_threshold_percent),
            confidence_score: confidence_score(&prices, volatility, span_days, self.config),
            observation_count: points.len(),
            window_start,
            window_end,
        }))
    }

    /// Analyzes every known combination, skipping the ones that fail.
    pub fn analyze_all(&self, lookback_days: i64, now: DateTime<Utc>) -> Result<Vec<TrendAnalysis>, StorageError> {
        let mut analyses = Vec::new();
        for (variant_id, marketplace_id, condition) in self.store.combinations()? {
            match self.analyze_at(variant_id, marketplace_id, condition, lookback_days, now) {
                Ok(Some(analysis)) => analyses.push(analysis),
                Ok(None) => {}
                Err(e) => warn!(
                    "Error analyzing combination {}/{}/{}: {}",
                    variant_id, marketplace_id, condition, e
                ),
            }
        }
        Ok(analyses)
    }
}

fn window_prices(points: &[(DateTime<Utc>, f64)], since: DateTime<Utc>) -> Vec<f64> {
    points
        .iter()
        .filter(|(at, _)| *at >= since)
        .map(|(_, p)| *p)
        .collect()
}

/// Slope of price against observation index, as a percentage of the mean price per step.
pub fn trend_direction(prices: &[f64], threshold_percent: f64) -> TrendDirection {
    if prices.len() < MIN_REGRESSION_POINTS {
        return TrendDirection::Stable;
    }
    let (Some(slope), Some(avg)) = (linear_slope(prices), mean(prices)) else {
        return TrendDirection::Stable;
    };
    if avg == 0.0 {
        return TrendDirection::Stable;
    }

    let normalized_slope = slope / avg * 100.0;
    if normalized_slope > threshold_percent {
        TrendDirection::Up
    } else if normalized_slope < -threshold_percent {
        TrendDirection::Down
    } else {
        TrendDirection::Stable
    }
}

/// Weighted blend of data density, price stability and time span, clamped to [0.1, 1].
pub fn confidence_score(prices: &[f64], volatility: f64, span_days: f64, config: &AnalysisConfig) -> f64 {
    if prices.len() < MIN_REGRESSION_POINTS {
        return config.insufficient_data_confidence;
    }

    let density_score = (prices.len() as f64 / config.density_target_points).min(1.0);

    let avg = mean(prices).unwrap_or(0.0);
    let volatility_ratio = if avg > 0.0 { volatility / avg } else { 1.0 };
    let volatility_score = (1.0 - volatility_ratio * 2.0).clamp(0.0, 1.0);

    let span_score = (span_days / config.span_target_days).clamp(0.0, 1.0);

    let confidence =
        density_score * DENSITY_WEIGHT + volatility_score * VOLATILITY_WEIGHT + span_score * SPAN_WEIGHT;
    confidence.clamp(MIN_CONFIDENCE, 1.0)
}
