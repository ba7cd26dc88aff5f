// Currency normalization: cache -> external providers -> static fallback.

pub mod fallback;
pub mod providers;

pub use fallback::FallbackRates;
pub use providers::{build_providers, RateProvider};

use crate::config::CurrencyConfig;
use crate::model::{ExchangeRateEntry, ProviderError, BASE_CURRENCY};
use crate::storage::RateCache;
use crate::utils::normalize_currency;
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

fn is_usable_rate(rate: f64) -> bool {
    rate.is_finite() && rate > 0.0
}

pub struct CurrencyNormalizer<C: RateCache> {
    cache: C,
    providers: Vec<Box<dyn RateProvider>>,
    fallback: FallbackRates,
    cache_window: chrono::Duration,
    provider_timeout: Duration,
    tracked_currencies: Vec<String>,
}

impl<C: RateCache> CurrencyNormalizer<C> {
    pub fn new(cache: C, providers: Vec<Box<dyn RateProvider>>, config: &CurrencyConfig) -> Self {
        Self {
            cache,
            providers,
            fallback: FallbackRates::new(config.fallback_rates.clone()),
            cache_window: chrono::Duration::hours(config.cache_hours),
            provider_timeout: Duration::from_secs(config.provider_timeout_seconds),
            tracked_currencies: config.tracked_currencies.iter().map(|c| normalize_currency(c)).collect(),
        }
    }

    /// Resolves how many `to` units one `from` unit is worth, or `None` when no tier can.
    pub async fn resolve_rate(&self, from: &str, to: &str) -> Option<f64> {
        let from = normalize_currency(from);
        let to = normalize_currency(to);
        if from == to {
            return Some(1.0);
        }

        if let Some(rate) = self.cached_rate(&from, &to) {
            debug!("Using cached rate {}/{}: {}", from, to, rate);
            return Some(rate);
        }

        if let Some((rate, source)) = self.external_rate(&from, &to).await {
            self.store_rate(&from, &to, rate, source);
            info!("Fetched rate {}/{} from {}: {}", from, to, source, rate);
            return Some(rate);
        }

        if let Some(rate) = self.fallback.rate(&from, &to) {
            warn!("Using fallback rate {}/{}: {}", from, to, rate);
            return Some(rate);
        }

        error!("Could not resolve exchange rate {}/{}", from, to);
        None
    }

    /// `amount / rate(currency -> USD)`; `None` means the amount stays unconverted.
    pub async fn convert_to_usd(&self, amount: f64, currency: &str) -> Option<f64> {
        let rate = self.resolve_rate(currency, BASE_CURRENCY).await?;
        Some(amount / rate)
    }

    /// Converts `(amount, currency, index)` items, resolving each distinct currency once.
    /// Results come back ordered by `index`.
    pub async fn bulk_convert(&self, items: &[(f64, String, usize)]) -> Vec<(usize, Option<f64>)> {
        let mut groups: BTreeMap<String, Vec<(f64, usize)>> = BTreeMap::new();
        for (amount, currency, index) in items {
            groups
                .entry(normalize_currency(currency))
                .or_default()
                .push((*amount, *index));
        }

        let rates = join_all(groups.keys().map(|currency| async move {
            (currency.clone(), self.resolve_rate(currency, BASE_CURRENCY).await)
        }))
        .await;

        let mut results = Vec::with_capacity(items.len());
        for (currency, rate) in rates {
            let Some(group) = groups.get(&currency) else { continue };
            for (amount, index) in group {
                results.push((*index, rate.map(|r| amount / r)));
            }
        }

        results.sort_by_key(|(index, _)| *index);
        results
    }

    /// Pulls the latest cached USD rate of every tracked currency into the fallback table.
    /// Returns how many currencies were updated.
    pub fn refresh_fallback_rates(&mut self) -> usize {
        let mut updated = 0;
        for currency in &self.tracked_currencies {
            match self.cache.latest_rate(currency, BASE_CURRENCY, None) {
                Ok(Some(entry)) if is_usable_rate(entry.rate) => {
                    // Cached rates are USD per unit; the table holds units per USD.
                    let units = 1.0 / entry.rate;
                    match self.fallback.units_per_usd(currency) {
                        Some(previous) => info!("Updated fallback rate for {}: {} -> {} per USD", currency, previous, units),
                        None => info!("Added fallback rate for {}: {} per USD", currency, units),
                    }
                    self.fallback.set_units_per_usd(currency, units);
                    updated += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read cached rate for {}: {:?}", currency, e),
            }
        }
        updated
    }

    pub fn supported_currencies(&self) -> Vec<String> {
        self.fallback.currencies()
    }

    fn cached_rate(&self, from: &str, to: &str) -> Option<f64> {
        let since = Utc::now() - self.cache_window;
        match self.cache.latest_rate(from, to, Some(since)) {
            Ok(Some(entry)) if is_usable_rate(entry.rate) => Some(entry.rate),
            Ok(_) => None,
            Err(e) => {
                warn!("Rate cache lookup failed for {}/{}: {:?}", from, to, e);
                None
            }
        }
    }

    async fn external_rate(&self, from: &str, to: &str) -> Option<(f64, &str)> {
        for provider in &self.providers {
            match self.attempt(provider.as_ref(), from, to).await {
                Ok(rate) if is_usable_rate(rate) => return Some((rate, provider.name())),
                Ok(rate) => debug!("{} returned unusable rate {} for {}/{}", provider.name(), rate, from, to),
                Err(e) => debug!("{} failed for {}/{}: {}", provider.name(), from, to, e),
            }
        }
        None
    }

    async fn attempt(&self, provider: &dyn RateProvider, from: &str, to: &str) -> Result<f64, ProviderError> {
        match timeout(self.provider_timeout, provider.fetch_rate(from, to)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.provider_timeout)),
        }
    }

    fn store_rate(&self, from: &str, to: &str, rate: f64, source: &str) {
        let entry = ExchangeRateEntry {
            from_currency: from.to_string(),
            to_currency: to.to_string(),
            rate,
            fetched_at: Utc::now(),
            source: source.to_string(),
        };
        if let Err(e) = self.cache.save_rate(&entry) {
            warn!("Failed to cache rate {}/{}: {:?}", from, to, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        name: &'static str,
        rate: Result<f64, ()>,
        delay: Option<Duration>,
        calls: Arc<AtomicUsize>,
    }

    impl StubProvider {
        fn returning(rate: f64, calls: Arc<AtomicUsize>) -> Box<dyn RateProvider> {
            Box::new(Self { name: "stub", rate: Ok(rate), delay: None, calls })
        }

        fn failing(calls: Arc<AtomicUsize>) -> Box<dyn RateProvider> {
            Box::new(Self { name: "broken", rate: Err(()), delay: None, calls })
        }
    }

    #[async_trait::async_trait]
    impl RateProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn fetch_rate(&self, _from: &str, _to: &str) -> Result<f64, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.rate.map_err(|_| ProviderError::Malformed("stub failure".into()))
        }
    }

    fn normalizer(providers: Vec<Box<dyn RateProvider>>) -> CurrencyNormalizer<Arc<SqliteStorage>> {
        let cache = Arc::new(SqliteStorage::new(":memory:").unwrap());
        CurrencyNormalizer::new(cache, providers, &CurrencyConfig::default())
    }

    fn cached(from: &str, rate: f64, age: chrono::Duration) -> ExchangeRateEntry {
        ExchangeRateEntry {
            from_currency: from.into(),
            to_currency: "USD".into(),
            rate,
            fetched_at: Utc::now() - age,
            source: "seed".into(),
        }
    }

    #[tokio::test]
    async fn usd_is_identity_without_lookups() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![StubProvider::returning(2.0, calls.clone())]);

        assert_eq!(n.resolve_rate("USD", "usd").await, Some(1.0));
        assert_eq!(n.convert_to_usd(123.45, "USD").await, Some(123.45));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_to_static_table() {
        let n = normalizer(Vec::new());
        let rate = n.resolve_rate("EUR", "USD").await.unwrap();
        assert!((rate - 1.0 / 0.85).abs() < 1e-9);
        assert!((rate - 1.176).abs() < 1e-3);

        let cross = n.resolve_rate("EUR", "GBP").await.unwrap();
        assert!((cross - 0.73 / 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn conversion_divides_by_resolved_rate() {
        let n = normalizer(Vec::new());
        for currency in ["EUR", "GBP", "JPY", "INR", "CAD", "AUD"] {
            let rate = n.resolve_rate(currency, "USD").await.unwrap();
            let converted = n.convert_to_usd(250.0, currency).await.unwrap();
            assert!((converted - 250.0 / rate).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn unknown_currency_is_unresolved() {
        let n = normalizer(Vec::new());
        assert_eq!(n.resolve_rate("XYZ", "USD").await, None);
        assert_eq!(n.convert_to_usd(10.0, "XYZ").await, None);
    }

    #[tokio::test]
    async fn external_rate_is_cached_and_reused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![StubProvider::returning(1.1, calls.clone())]);

        assert_eq!(n.resolve_rate("EUR", "USD").await, Some(1.1));
        assert_eq!(n.resolve_rate("EUR", "USD").await, Some(1.1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stored = n.cache.latest_rate("EUR", "USD", None).unwrap().unwrap();
        assert_eq!(stored.rate, 1.1);
        assert_eq!(stored.source, "stub");
    }

    #[tokio::test]
    async fn failing_provider_is_skipped() {
        let failed = Arc::new(AtomicUsize::new(0));
        let good = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![
            StubProvider::failing(failed.clone()),
            StubProvider::returning(1.3, good.clone()),
        ]);

        assert_eq!(n.resolve_rate("GBP", "USD").await, Some(1.3));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(good.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unusable_rate_is_never_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![
            StubProvider::returning(f64::NAN, calls.clone()),
            StubProvider::returning(-2.0, calls.clone()),
        ]);

        let rate = n.resolve_rate("EUR", "USD").await.unwrap();
        assert!((rate - 1.0 / 0.85).abs() < 1e-9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(n.cache.latest_rate("EUR", "USD", None).unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out_to_next_tier() {
        let calls = Arc::new(AtomicUsize::new(0));
        let slow: Box<dyn RateProvider> = Box::new(StubProvider {
            name: "slow",
            rate: Ok(9.9),
            delay: Some(Duration::from_secs(5)),
            calls: calls.clone(),
        });
        let mut n = normalizer(vec![slow]);
        n.provider_timeout = Duration::from_millis(50);

        let rate = n.resolve_rate("EUR", "USD").await.unwrap();
        assert!((rate - 1.0 / 0.85).abs() < 1e-9);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_reports_timeout_error() {
        let mut n = normalizer(Vec::new());
        n.provider_timeout = Duration::from_millis(20);
        let slow = StubProvider {
            name: "slow",
            rate: Ok(1.5),
            delay: Some(Duration::from_secs(5)),
            calls: Arc::new(AtomicUsize::new(0)),
        };

        let outcome = n.attempt(&slow, "GBP", "USD").await;
        assert!(matches!(outcome, Err(ProviderError::Timeout(d)) if d == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn stale_cache_entry_is_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![StubProvider::returning(1.2, calls.clone())]);
        n.cache.save_rate(&cached("EUR", 1.05, chrono::Duration::hours(30))).unwrap();

        assert_eq!(n.resolve_rate("EUR", "USD").await, Some(1.2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fresh_cache_entry_wins_over_providers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![StubProvider::returning(1.2, calls.clone())]);
        n.cache.save_rate(&cached("EUR", 1.05, chrono::Duration::hours(2))).unwrap();

        assert_eq!(n.resolve_rate("EUR", "USD").await, Some(1.05));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bulk_convert_resolves_once_per_currency_and_keeps_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let n = normalizer(vec![StubProvider::returning(2.0, calls.clone())]);
        let items = vec![
            (100.0, "EUR".to_string(), 0),
            (50.0, "GBP".to_string(), 1),
            (10.0, "eur".to_string(), 2),
            (7.0, "USD".to_string(), 3),
            (30.0, "GBP".to_string(), 4),
        ];

        let results = n.bulk_convert(&items).await;
        assert_eq!(
            results,
            vec![(0, Some(50.0)), (1, Some(25.0)), (2, Some(5.0)), (3, Some(7.0)), (4, Some(15.0))]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bulk_convert_leaves_unresolved_items_empty() {
        let n = normalizer(Vec::new());
        let items = vec![(5.0, "XYZ".to_string(), 0), (85.0, "EUR".to_string(), 1)];
        let results = n.bulk_convert(&items).await;
        assert_eq!(results[0], (0, None));
        assert_eq!(results[1].0, 1);
        assert!((results[1].1.unwrap() - 85.0 * 0.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn refresh_pulls_cached_rates_into_fallback() {
        let mut n = normalizer(Vec::new());
        n.cache.save_rate(&cached("EUR", 1.25, chrono::Duration::days(3))).unwrap();

        assert_eq!(n.refresh_fallback_rates(), 1);
        assert_eq!(n.fallback.units_per_usd("EUR"), Some(0.8));
        // Stale for the cache tier, but the fallback now reflects it.
        let rate = n.resolve_rate("EUR", "USD").await.unwrap();
        assert!((rate - 1.25).abs() < 1e-9);
        assert!(n.supported_currencies().contains(&"EUR".to_string()));
    }
}
