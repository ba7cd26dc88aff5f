// Storage module: data-access seams used by the engine, plus the SQLite adapter.

pub mod sqlite;

pub use sqlite::SqliteStorage;

use crate::model::{
    Condition, ExchangeRateEntry, Marketplace, PriceObservation, ProductVariant, StorageError,
    TrendPeriod, TrendSnapshot,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Read access to observations and the entities they reference.
pub trait ObservationStore {
    fn variant(&self, id: i64) -> Result<Option<ProductVariant>, StorageError>;
    fn marketplace(&self, id: i64) -> Result<Option<Marketplace>, StorageError>;

    /// Normalized observations for one combination within `[since, until]`, oldest first.
    fn combination_history(
        &self,
        variant_id: i64,
        marketplace_id: i64,
        condition: Condition,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StorageError>;

    /// All observations (normalized or not) up to `until`, from `since` when given.
    fn observations_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StorageError>;

    /// Latest observation per (variant, marketplace, condition) at or before `until`.
    fn latest_observations(&self, until: DateTime<Utc>) -> Result<Vec<PriceObservation>, StorageError>;

    fn observation_count(&self, since: Option<DateTime<Utc>>, until: DateTime<Utc>) -> Result<usize, StorageError>;

    /// (variant id, observation count) within `[since, until]`.
    fn counts_by_variant(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<(i64, usize)>, StorageError>;

    /// (marketplace id, observation count) within `[since, until]`.
    fn counts_by_marketplace(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(i64, usize)>, StorageError>;

    /// Mean USD price per brand over normalized observations within `[since, until]`.
    fn brand_average_prices(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeMap<String, f64>, StorageError>;

    /// Distinct (variant, marketplace, condition) triples with at least one observation.
    fn combinations(&self) -> Result<Vec<(i64, i64, Condition)>, StorageError>;
}

/// Exchange-rate cache tier.
pub trait RateCache {
    /// Most recent entry for the pair, optionally no older than `since`.
    fn latest_rate(
        &self,
        from: &str,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<ExchangeRateEntry>, StorageError>;

    /// Upsert; last write wins per pair.
    fn save_rate(&self, entry: &ExchangeRateEntry) -> Result<(), StorageError>;
}

/// Periodic trend snapshots produced by the snapshot job.
pub trait SnapshotSource {
    fn snapshots_since(&self, since: DateTime<Utc>, period: TrendPeriod) -> Result<Vec<TrendSnapshot>, StorageError>;
}

impl<T: RateCache + ?Sized> RateCache for Arc<T> {
    fn latest_rate(
        &self,
        from: &str,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<ExchangeRateEntry>, StorageError> {
        (**self).latest_rate(from, to, since)
    }

    fn save_rate(&self, entry: &ExchangeRateEntry) -> Result<(), StorageError> {
        (**self).save_rate(entry)
    }
}
