use chrono::{DateTime, Utc};
use resale_pulse::analyzer::{rank_by_confidence, InsightGenerator, TrendAnalyzer};
use resale_pulse::config::{load_config, AppConfig};
use resale_pulse::currency::{build_providers, CurrencyNormalizer};
use resale_pulse::model::{TrendPeriod, TrendSnapshot};
use resale_pulse::normalizer::normalize_pending;
use resale_pulse::storage::SqliteStorage;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Config load error ({}): {}", config_path, e);
            return;
        }
    };

    let storage = match SqliteStorage::new(&config.database_path) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("Failed to initialize storage: {:?}", e);
            return;
        }
    };

    let providers = match build_providers(&config.currency) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to build rate providers: {}", e);
            return;
        }
    };
    let mut currency = CurrencyNormalizer::new(storage.clone(), providers, &config.currency);
    info!("Fallback currencies: {}", currency.supported_currencies().join(", "));

    loop {
        info!("Starting analysis cycle...");
        run_cycle(&config, &storage, &mut currency).await;

        info!("Waiting {}s for the next cycle...", config.check_interval_seconds);
        tokio::select! {
            _ = sleep(Duration::from_secs(config.check_interval_seconds)) => {
                info!("Timer triggered.");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested.");
                break;
            }
        }
    }
}

/// One pass: normalize new observations, analyze, snapshot, report insights, purge.
async fn run_cycle(
    config: &AppConfig,
    storage: &SqliteStorage,
    currency: &mut CurrencyNormalizer<Arc<SqliteStorage>>,
) {
    match normalize_pending(storage, &*currency).await {
        Ok(report) => info!(
            "Normalized {} observations ({} unresolved)",
            report.converted, report.unresolved
        ),
        Err(e) => warn!("Normalization failed: {:?}", e),
    }

    let refreshed = currency.refresh_fallback_rates();
    info!("Refreshed {} fallback rates from cache", refreshed);

    let now = Utc::now();
    let analyzer = TrendAnalyzer::new(storage, &config.analysis);
    match analyzer.analyze_all(config.analysis.lookback_days, now) {
        Ok(analyses) => {
            info!("Analyzed {} combinations", analyses.len());
            for a in &analyses {
                info!(
                    "{} @ {} ({}): ${:.2} ({:+.1}%), trend {}, confidence {:.2}",
                    a.variant.label(),
                    a.marketplace.name,
                    a.condition,
                    a.current_price,
                    a.price_change_percent,
                    a.trend_direction.as_str(),
                    a.confidence_score
                );
            }
        }
        Err(e) => warn!("Trend analysis failed: {:?}", e),
    }

    for period in [TrendPeriod::Weekly, TrendPeriod::Monthly] {
        take_snapshots(storage, &analyzer, period, now);
    }

    report_insights(config, storage, now);

    let cutoff = now - chrono::Duration::days(config.retention_days);
    match storage.purge_observations_before(cutoff) {
        Ok(0) => {}
        Ok(n) => info!("Purged {} observations older than {} days", n, config.retention_days),
        Err(e) => warn!("Retention purge failed: {:?}", e),
    }
}

/// Persists one snapshot per combination once the previous batch for `period` is due.
fn take_snapshots(
    storage: &SqliteStorage,
    analyzer: &TrendAnalyzer<'_, SqliteStorage>,
    period: TrendPeriod,
    now: DateTime<Utc>,
) {
    let due = match storage.latest_snapshot_time(period) {
        Ok(Some(last)) => now - last >= chrono::Duration::days(period.lookback_days()),
        Ok(None) => true,
        Err(e) => {
            warn!("Could not read last {} snapshot time: {:?}", period.as_str(), e);
            false
        }
    };
    if !due {
        return;
    }

    match analyzer.analyze_all(period.lookback_days(), now) {
        Ok(analyses) => {
            let snapshots: Vec<TrendSnapshot> = analyses
                .iter()
                .map(|a| TrendSnapshot::from_analysis(a, period, now))
                .collect();
            match storage.save_snapshots(&snapshots) {
                Ok(n) => info!("Saved {} {} trend snapshots", n, period.as_str()),
                Err(e) => warn!("Failed to save {} snapshots: {:?}", period.as_str(), e),
            }
        }
        Err(e) => warn!("Snapshot analysis failed: {:?}", e),
    }
}

fn report_insights(config: &AppConfig, storage: &SqliteStorage, now: DateTime<Utc>) {
    let generator = InsightGenerator::new(storage, &config.insights, now);
    let mut insights = Vec::new();

    match generator.find_arbitrage(config.insights.arbitrage_min_profit_percent) {
        Ok(found) => insights.extend(found),
        Err(e) => warn!("Arbitrage scan failed: {}", e),
    }
    match generator.find_significant_changes(config.insights.significant_change_percent) {
        Ok(found) => insights.extend(found),
        Err(e) => warn!("Price change scan failed: {}", e),
    }
    match generator.find_best_deals(config.insights.best_deals_top_n) {
        Ok(found) => insights.extend(found),
        Err(e) => warn!("Best deal scan failed: {}", e),
    }

    rank_by_confidence(&mut insights);
    info!("Generated {} market insights", insights.len());
    for insight in &insights {
        info!("[{:?}] {}: {} (confidence {:.2})", insight.kind, insight.title, insight.description, insight.confidence);
    }

    match generator.market_summary() {
        Ok(summary) => match serde_json::to_string(&summary) {
            Ok(json) => info!("Market summary: {}", json),
            Err(e) => warn!("Failed to serialize market summary: {}", e),
        },
        Err(e) => warn!("Market summary failed: {}", e),
    }
}
