use crate::config::InsightConfig;
use crate::model::{
    AnalysisError, Condition, InsightKind, MarketInsight, MarketSummary, Marketplace, PopularVariant,
    PriceObservation, ProductVariant, TrendPeriod,
};
use crate::storage::{ObservationStore, SnapshotSource};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

type GroupKey = (i64, Condition);

/// Ranked market insights over the current observation and snapshot set.
/// Every producer is read-only; `now` anchors all time windows.
pub struct InsightGenerator<'a, S: ObservationStore + SnapshotSource + ?Sized> {
    store: &'a S,
    config: &'a InsightConfig,
    now: DateTime<Utc>,
}

impl<'a, S: ObservationStore + SnapshotSource + ?Sized> InsightGenerator<'a, S> {
    pub fn new(store: &'a S, config: &'a InsightConfig, now: DateTime<Utc>) -> Self {
        Self { store, config, now }
    }

    /// Cross-marketplace price gaps for the same (variant, condition), largest first.
    pub fn find_arbitrage(&self, min_profit_percent: f64) -> Result<Vec<MarketInsight>, AnalysisError> {
        // Latest price per marketplace within each group
        let mut groups: BTreeMap<GroupKey, Vec<(i64, Option<f64>)>> = BTreeMap::new();
        for obs in self.store.latest_observations(self.now)? {
            groups
                .entry((obs.variant_id, obs.condition))
                .or_default()
                .push((obs.marketplace_id, obs.price_usd));
        }

        let mut found = Vec::new();
        for (key, latest) in groups {
            if latest.len() < 2 {
                continue;
            }
            let Some(mut prices) = latest
                .into_iter()
                .map(|(marketplace_id, price)| price.map(|p| (marketplace_id, p)))
                .collect::<Option<Vec<(i64, f64)>>>()
            else {
                continue;
            };

            prices.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let cheapest = prices[0];
            let priciest = prices[prices.len() - 1];
            if cheapest.1 <= 0.0 {
                continue;
            }

            let profit_percent = (priciest.1 - cheapest.1) / cheapest.1 * 100.0;
            if profit_percent >= min_profit_percent {
                found.push((key, profit_percent, cheapest, priciest));
            }
        }

        found.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        debug!("Found {} arbitrage opportunities", found.len());

        let mut insights = Vec::with_capacity(found.len());
        for ((variant_id, condition), profit_percent, (buy_id, buy_price), (sell_id, sell_price)) in found {
            let variant = self.variant(variant_id)?;
            let buy = self.marketplace(buy_id)?;
            let sell = self.marketplace(sell_id)?;
            insights.push(MarketInsight {
                kind: InsightKind::Arbitrage,
                title: format!("Arbitrage Opportunity: {}", variant.label()),
                description: format!(
                    "Buy from {} (${:.2}) and sell on {} (${:.2}) for {:.1}% profit ({} condition)",
                    buy.name, buy_price, sell.name, sell_price, profit_percent, condition
                ),
                variant: variant.label(),
                marketplace: format!("{} → {}", buy.name, sell.name),
                region: format!("{} → {}", buy.region, sell.region),
                value: profit_percent,
                confidence: self.config.arbitrage_confidence,
            });
        }
        Ok(insights)
    }

    /// Weekly snapshots from the recent window whose change meets the threshold, largest move first.
    pub fn find_significant_changes(&self, min_change_percent: f64) -> Result<Vec<MarketInsight>, AnalysisError> {
        let since = self.now - Duration::days(self.config.snapshot_lookback_days);
        let mut snapshots: Vec<_> = self
            .store
            .snapshots_since(since, TrendPeriod::Weekly)?
            .into_iter()
            .filter(|s| s.price_change_percent.abs() >= min_change_percent)
            .collect();

        snapshots.sort_by(|a, b| {
            b.price_change_percent
                .abs()
                .total_cmp(&a.price_change_percent.abs())
                .then_with(|| {
                    (a.variant_id, a.marketplace_id, a.condition).cmp(&(b.variant_id, b.marketplace_id, b.condition))
                })
        });

        snapshots
            .into_iter()
            .map(|snapshot| -> Result<MarketInsight, AnalysisError> {
                let variant = self.variant(snapshot.variant_id)?;
                let marketplace = self.marketplace(snapshot.marketplace_id)?;
                let dropped = snapshot.price_change_percent < 0.0;
                let change = snapshot.price_change_percent.abs();
                Ok(MarketInsight {
                    kind: if dropped { InsightKind::PriceDrop } else { InsightKind::PriceIncrease },
                    title: format!("Significant Price Change: {}", variant.label()),
                    description: format!(
                        "Price {} by {:.1}% on {} to ${:.2} ({} condition)",
                        if dropped { "dropped" } else { "increased" },
                        change,
                        marketplace.name,
                        snapshot.current_price_usd,
                        snapshot.condition
                    ),
                    variant: variant.label(),
                    marketplace: marketplace.name,
                    region: marketplace.region,
                    value: change,
                    confidence: self.config.significant_change_confidence,
                })
            })
            .collect()
    }

    /// Cheapest recent available listing per (variant, condition), cheapest first.
    pub fn find_best_deals(&self, top_n: usize) -> Result<Vec<MarketInsight>, AnalysisError> {
        let recent_since = self.now - Duration::days(self.config.best_deal_recency_days);
        let average_since = self.now - Duration::days(self.config.best_deal_average_days);
        let observations = self
            .store
            .observations_between(Some(recent_since.min(average_since)), self.now)?;

        #[derive(Default)]
        struct Group<'o> {
            best: Option<(&'o PriceObservation, f64)>,
            sum: f64,
            count: usize,
        }

        let mut groups: BTreeMap<GroupKey, Group<'_>> = BTreeMap::new();
        for obs in &observations {
            let Some(price) = obs.price_usd else { continue };
            let group = groups.entry((obs.variant_id, obs.condition)).or_default();

            if obs.observed_at >= average_since {
                group.sum += price;
                group.count += 1;
            }
            if obs.available && obs.observed_at >= recent_since {
                match group.best {
                    Some((_, best)) if price >= best => {}
                    _ => group.best = Some((obs, price)),
                }
            }
        }

        let mut deals: Vec<(GroupKey, &PriceObservation, f64, f64)> = groups
            .into_iter()
            .filter_map(|(key, group)| {
                let (obs, price) = group.best?;
                // A deal is measured against at least one other observation.
                if group.count < 2 {
                    return None;
                }
                let average = group.sum / group.count as f64;
                if average <= 0.0 {
                    return None;
                }
                Some((key, obs, price, (average - price) / average * 100.0))
            })
            .collect();

        deals.sort_by(|a, b| a.2.total_cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        deals.truncate(top_n);

        deals
            .into_iter()
            .map(|((variant_id, condition), obs, price, savings_percent)| -> Result<MarketInsight, AnalysisError> {
                let variant = self.variant(variant_id)?;
                let marketplace = self.marketplace(obs.marketplace_id)?;
                Ok(MarketInsight {
                    kind: InsightKind::BestDeal,
                    title: format!("Best Deal: {}", variant.label()),
                    description: format!(
                        "${:.2} on {} ({} condition, {:.1}% {} average)",
                        price,
                        marketplace.name,
                        condition,
                        savings_percent.abs(),
                        if savings_percent >= 0.0 { "below" } else { "above" }
                    ),
                    variant: variant.label(),
                    marketplace: marketplace.name,
                    region: marketplace.region,
                    value: price,
                    confidence: self.config.best_deal_confidence,
                })
            })
            .collect()
    }

    /// Aggregate counts and averages; complete even when there is no data.
    pub fn market_summary(&self) -> Result<MarketSummary, AnalysisError> {
        let recent_since = self.now - Duration::days(self.config.summary_window_days);

        let mut ranked = self.store.counts_by_variant(recent_since, self.now)?;
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let mut popular_variants = Vec::new();
        for (id, observation_count) in ranked.into_iter().take(self.config.popular_variants_limit) {
            let variant = self.variant(id)?;
            popular_variants.push(PopularVariant {
                brand: variant.brand,
                model_name: variant.model_name,
                storage: variant.storage,
                observation_count,
            });
        }

        let mut marketplace_activity = Vec::new();
        for (id, count) in self.store.counts_by_marketplace(recent_since, self.now)? {
            marketplace_activity.push((self.marketplace(id)?.name, count));
        }
        marketplace_activity.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(MarketSummary {
            total_observations: self.store.observation_count(None, self.now)?,
            recent_observations: self.store.observation_count(Some(recent_since), self.now)?,
            brand_avg_prices: self.store.brand_average_prices(recent_since, self.now)?,
            popular_variants,
            marketplace_activity,
            last_updated: self.now,
        })
    }

    fn variant(&self, id: i64) -> Result<ProductVariant, AnalysisError> {
        self.store.variant(id)?.ok_or(AnalysisError::UnknownVariant(id))
    }

    fn marketplace(&self, id: i64) -> Result<Marketplace, AnalysisError> {
        self.store.marketplace(id)?.ok_or(AnalysisError::UnknownMarketplace(id))
    }
}

/// Orders insights for display: highest confidence first, then largest value.
pub fn rank_by_confidence(insights: &mut [MarketInsight]) {
    insights.sort_by(|a, b| match b.confidence.total_cmp(&a.confidence) {
        Ordering::Equal => b.value.total_cmp(&a.value),
        other => other,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TrendSnapshot;
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;

    struct Market {
        storage: SqliteStorage,
        config: InsightConfig,
        now: DateTime<Utc>,
    }

    impl Market {
        fn new() -> Self {
            Self {
                storage: SqliteStorage::new(":memory:").unwrap(),
                config: InsightConfig::default(),
                now: Utc.with_ymd_and_hms(2024, 10, 15, 9, 0, 0).unwrap(),
            }
        }

        fn variant(&self, brand: &str, model: &str) -> i64 {
            self.storage.upsert_variant(brand, model, "256GB").unwrap()
        }

        fn marketplace(&self, name: &str, region: &str) -> i64 {
            self.storage.upsert_marketplace(name, region, "https://example.com").unwrap()
        }

        fn observe(&self, variant: i64, marketplace: i64, price_usd: Option<f64>, hours_ago: i64, available: bool) {
            let obs = PriceObservation {
                id: None,
                variant_id: variant,
                marketplace_id: marketplace,
                condition: Condition::Good,
                price: price_usd.unwrap_or(100.0),
                currency: "USD".into(),
                price_usd,
                available,
                stock_count: None,
                product_url: None,
                observed_at: self.now - Duration::hours(hours_ago),
                session_id: "test".into(),
            };
            self.storage.save_observations(&[obs]).unwrap();
        }

        fn generator(&self) -> InsightGenerator<'_, SqliteStorage> {
            InsightGenerator::new(&self.storage, &self.config, self.now)
        }
    }

    #[test]
    fn arbitrage_between_two_marketplaces() {
        let m = Market::new();
        let v = m.variant("Google", "Pixel 9");
        let swappa = m.marketplace("Swappa", "US");
        let rebuy = m.marketplace("Rebuy", "Europe");
        m.observe(v, swappa, Some(500.0), 2, true);
        m.observe(v, rebuy, Some(600.0), 1, true);

        let insights = m.generator().find_arbitrage(10.0).unwrap();
        assert_eq!(insights.len(), 1);
        let insight = &insights[0];
        assert_eq!(insight.kind, InsightKind::Arbitrage);
        assert!((insight.value - 20.0).abs() < 1e-9);
        assert_eq!(insight.marketplace, "Swappa → Rebuy");
        assert_eq!(insight.region, "US → Europe");
        assert_eq!(insight.confidence, 0.8);
    }

    #[test]
    fn arbitrage_uses_latest_price_per_marketplace() {
        let m = Market::new();
        let v = m.variant("Apple", "iPhone 16");
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Gazelle", "US");
        m.observe(v, a, Some(300.0), 48, true);
        m.observe(v, a, Some(590.0), 1, true);
        m.observe(v, b, Some(600.0), 1, true);

        assert!(m.generator().find_arbitrage(10.0).unwrap().is_empty());
    }

    #[test]
    fn arbitrage_needs_two_marketplaces_and_converted_prices() {
        let m = Market::new();
        let v = m.variant("Samsung", "Galaxy S24");
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Mercari", "Japan");
        m.observe(v, a, Some(400.0), 5, true);
        m.observe(v, a, Some(800.0), 4, true);
        assert!(m.generator().find_arbitrage(0.0).unwrap().is_empty());

        m.observe(v, b, None, 1, true);
        assert!(m.generator().find_arbitrage(0.0).unwrap().is_empty());
    }

    #[test]
    fn arbitrage_is_sorted_and_respects_threshold() {
        let m = Market::new();
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Refurbed", "Europe");
        let small = m.variant("Google", "Pixel 9");
        let large = m.variant("Apple", "iPhone 16 Pro");
        let below = m.variant("Samsung", "Galaxy Z Fold6");
        m.observe(small, a, Some(500.0), 1, true);
        m.observe(small, b, Some(575.0), 1, true);
        m.observe(large, a, Some(800.0), 1, true);
        m.observe(large, b, Some(1200.0), 1, true);
        m.observe(below, a, Some(1000.0), 1, true);
        m.observe(below, b, Some(1050.0), 1, true);

        let insights = m.generator().find_arbitrage(10.0).unwrap();
        let values: Vec<f64> = insights.iter().map(|i| i.value).collect();
        assert_eq!(values.len(), 2);
        assert!((values[0] - 50.0).abs() < 1e-9);
        assert!((values[1] - 15.0).abs() < 1e-9);
        assert!(values.iter().all(|v| *v >= 10.0));
    }

    #[test]
    fn equal_prices_meet_a_zero_threshold() {
        let m = Market::new();
        let v = m.variant("Google", "Pixel 9");
        let swappa = m.marketplace("Swappa", "US");
        let gazelle = m.marketplace("Gazelle", "US");
        m.observe(v, swappa, Some(500.0), 2, true);
        m.observe(v, gazelle, Some(500.0), 1, true);

        let insights = m.generator().find_arbitrage(0.0).unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].value, 0.0);
        assert_eq!(insights[0].marketplace, "Swappa → Gazelle");
        assert!(m.generator().find_arbitrage(0.1).unwrap().is_empty());
    }

    #[test]
    fn equal_profits_are_ordered_by_group() {
        let m = Market::new();
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Rebuy", "Europe");
        let first = m.variant("Apple", "iPhone 16");
        let second = m.variant("Google", "Pixel 9");
        m.observe(second, a, Some(400.0), 2, true);
        m.observe(second, b, Some(480.0), 2, true);
        m.observe(first, b, Some(600.0), 1, true);
        m.observe(first, a, Some(500.0), 1, true);

        let insights = m.generator().find_arbitrage(10.0).unwrap();
        let variants: Vec<&str> = insights.iter().map(|i| i.variant.as_str()).collect();
        assert_eq!(variants, vec!["Apple iPhone 16 256GB", "Google Pixel 9 256GB"]);
        assert!(insights.iter().all(|i| (i.value - 20.0).abs() < 1e-9));
    }

    #[test]
    fn arbitrage_ignores_rows_after_now() {
        let m = Market::new();
        let v = m.variant("Samsung", "Galaxy S24");
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Refurbed", "Europe");
        m.observe(v, a, Some(500.0), 2, true);
        m.observe(v, b, Some(600.0), 1, true);
        // Recorded after the generator's reference time.
        m.observe(v, a, Some(600.0), -5, true);

        let insights = m.generator().find_arbitrage(10.0).unwrap();
        assert_eq!(insights.len(), 1);
        assert!((insights[0].value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn significant_changes_from_recent_weekly_snapshots() {
        let m = Market::new();
        let v = m.variant("Google", "Pixel 9 Pro");
        let mp = m.marketplace("Back Market", "US");
        let snapshot = |pct: f64, days_ago: i64, period: TrendPeriod| TrendSnapshot {
            variant_id: v,
            marketplace_id: mp,
            condition: Condition::Good,
            period,
            taken_at: m.now - Duration::days(days_ago),
            current_price_usd: 700.0,
            previous_price_usd: Some(750.0),
            price_change_amount: -50.0,
            price_change_percent: pct,
            avg_price: 720.0,
            min_price: 700.0,
            max_price: 750.0,
            volatility: 10.0,
        };
        m.storage
            .save_snapshots(&[
                snapshot(-12.0, 1, TrendPeriod::Weekly),
                snapshot(25.0, 2, TrendPeriod::Weekly),
                snapshot(4.0, 2, TrendPeriod::Weekly),
                snapshot(-40.0, 10, TrendPeriod::Weekly),
                snapshot(-60.0, 1, TrendPeriod::Monthly),
            ])
            .unwrap();

        let insights = m.generator().find_significant_changes(10.0).unwrap();
        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].kind, InsightKind::PriceIncrease);
        assert!((insights[0].value - 25.0).abs() < 1e-9);
        assert_eq!(insights[1].kind, InsightKind::PriceDrop);
        assert!((insights[1].value - 12.0).abs() < 1e-9);
        assert!(insights.iter().all(|i| i.confidence == 0.9));
    }

    #[test]
    fn best_deals_are_cheapest_first_and_bounded() {
        let m = Market::new();
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Gazelle", "US");
        let cheap = m.variant("Google", "Pixel 9");
        let mid = m.variant("Samsung", "Galaxy S24");
        let pricey = m.variant("Apple", "iPhone 16 Pro Max");
        for (variant, low, high) in [(cheap, 300.0, 400.0), (mid, 500.0, 600.0), (pricey, 900.0, 1100.0)] {
            m.observe(variant, a, Some(high), 24 * 10, true);
            m.observe(variant, b, Some(low), 24, true);
        }

        let deals = m.generator().find_best_deals(2).unwrap();
        assert_eq!(deals.len(), 2);
        assert_eq!(deals[0].value, 300.0);
        assert_eq!(deals[1].value, 500.0);
        assert!(deals.iter().all(|d| d.kind == InsightKind::BestDeal && d.confidence == 0.7));
        assert_eq!(deals[0].marketplace, "Gazelle");
        assert!(deals[0].description.contains("14.3% below"));
    }

    #[test]
    fn best_deals_skip_unavailable_stale_and_lonely_groups() {
        let m = Market::new();
        let a = m.marketplace("Swappa", "US");
        let sold_out = m.variant("Google", "Pixel 9");
        let stale = m.variant("Apple", "iPhone 16");
        let lonely = m.variant("Samsung", "Galaxy S24");

        m.observe(sold_out, a, Some(200.0), 1, false);
        m.observe(sold_out, a, Some(250.0), 24 * 5, true);
        m.observe(stale, a, Some(300.0), 24 * 5, true);
        m.observe(stale, a, Some(310.0), 24 * 6, true);
        m.observe(lonely, a, Some(400.0), 1, true);

        assert!(m.generator().find_best_deals(10).unwrap().is_empty());
    }

    #[test]
    fn best_deals_skip_zero_average_groups() {
        let m = Market::new();
        let a = m.marketplace("Swappa", "US");
        let b = m.marketplace("Gazelle", "US");
        let free = m.variant("Google", "Pixel 6");
        m.observe(free, a, Some(0.0), 24, true);
        m.observe(free, b, Some(0.0), 2, true);

        assert!(m.generator().find_best_deals(10).unwrap().is_empty());
    }

    #[test]
    fn summary_with_no_data_is_complete() {
        let m = Market::new();
        let summary = m.generator().market_summary().unwrap();
        assert_eq!(summary.total_observations, 0);
        assert_eq!(summary.recent_observations, 0);
        assert!(summary.brand_avg_prices.is_empty());
        assert!(summary.popular_variants.is_empty());
        assert!(summary.marketplace_activity.is_empty());
        assert_eq!(summary.last_updated, m.now);
    }

    #[test]
    fn summary_aggregates_recent_activity() {
        let m = Market::new();
        let swappa = m.marketplace("Swappa", "US");
        let rebuy = m.marketplace("Rebuy", "Europe");
        let pixel = m.variant("Google", "Pixel 9");
        let iphone = m.variant("Apple", "iPhone 16");

        m.observe(pixel, swappa, Some(400.0), 1, true);
        m.observe(pixel, rebuy, Some(500.0), 2, true);
        m.observe(pixel, swappa, None, 3, true);
        m.observe(iphone, swappa, Some(800.0), 4, true);
        m.observe(iphone, rebuy, Some(100.0), 24 * 20, true);

        let summary = m.generator().market_summary().unwrap();
        assert_eq!(summary.total_observations, 5);
        assert_eq!(summary.recent_observations, 4);
        assert_eq!(summary.brand_avg_prices.get("Google"), Some(&450.0));
        assert_eq!(summary.brand_avg_prices.get("Apple"), Some(&800.0));
        assert_eq!(summary.popular_variants[0].model_name, "Pixel 9");
        assert_eq!(summary.popular_variants[0].observation_count, 3);
        assert_eq!(
            summary.marketplace_activity,
            vec![("Swappa".to_string(), 3), ("Rebuy".to_string(), 1)]
        );
    }

    #[test]
    fn ranking_prefers_confidence() {
        let insight = |confidence: f64, value: f64| MarketInsight {
            kind: InsightKind::BestDeal,
            title: String::new(),
            description: String::new(),
            variant: String::new(),
            marketplace: String::new(),
            region: String::new(),
            value,
            confidence,
        };
        let mut insights = vec![insight(0.7, 5.0), insight(0.9, 1.0), insight(0.7, 9.0)];
        rank_by_confidence(&mut insights);
        let order: Vec<(f64, f64)> = insights.iter().map(|i| (i.confidence, i.value)).collect();
        assert_eq!(order, vec![(0.9, 1.0), (0.7, 9.0), (0.7, 5.0)]);
    }
}
