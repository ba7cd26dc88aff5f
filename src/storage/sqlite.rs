use crate::model::{
    Condition, ExchangeRateEntry, Marketplace, PriceObservation, ProductVariant, StorageError,
    TrendPeriod, TrendSnapshot,
};
use crate::storage::{ObservationStore, RateCache, SnapshotSource};
use crate::utils::{format_datetime, parse_datetime};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

const OBSERVATION_COLUMNS: &str = "id, variant_id, marketplace_id, condition, price, currency, price_usd,
     available, stock_count, product_url, observed_at, session_id";

const SNAPSHOT_COLUMNS: &str = "variant_id, marketplace_id, condition, period, taken_at, current_price_usd,
     previous_price_usd, price_change_amount, price_change_percent, avg_price, min_price, max_price, volatility";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens the database (":memory:" for a throwaway one) and runs migrations.
    pub fn new(db_path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS product_variants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                brand TEXT NOT NULL,
                model_name TEXT NOT NULL,
                storage TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (brand, model_name, storage)
            );

            CREATE TABLE IF NOT EXISTS marketplaces (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                region TEXT NOT NULL,
                base_url TEXT NOT NULL DEFAULT '',
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS price_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                variant_id INTEGER NOT NULL REFERENCES product_variants(id),
                marketplace_id INTEGER NOT NULL REFERENCES marketplaces(id),
                condition TEXT NOT NULL,
                price REAL NOT NULL,
                currency TEXT NOT NULL,
                price_usd REAL,
                available INTEGER NOT NULL DEFAULT 1,
                observed_at TEXT NOT NULL,
                session_id TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_obs_combination
                ON price_observations (variant_id, marketplace_id, condition, observed_at);
            CREATE INDEX IF NOT EXISTS idx_obs_observed_at ON price_observations (observed_at);
            CREATE INDEX IF NOT EXISTS idx_obs_session ON price_observations (session_id);

            CREATE TABLE IF NOT EXISTS exchange_rates (
                from_currency TEXT NOT NULL,
                to_currency TEXT NOT NULL,
                rate REAL NOT NULL,
                fetched_at TEXT NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (from_currency, to_currency)
            );

            CREATE TABLE IF NOT EXISTS trend_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                variant_id INTEGER NOT NULL,
                marketplace_id INTEGER NOT NULL,
                condition TEXT NOT NULL,
                period TEXT NOT NULL,
                taken_at TEXT NOT NULL,
                current_price_usd REAL NOT NULL,
                previous_price_usd REAL,
                price_change_amount REAL NOT NULL,
                price_change_percent REAL NOT NULL,
                avg_price REAL NOT NULL,
                min_price REAL NOT NULL,
                max_price REAL NOT NULL,
                volatility REAL NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_snapshot_period_date ON trend_snapshots (period, taken_at);
            ",
        )?;

        // Columns added after the first schema version
        Self::migrate_add_column_if_missing(&conn, "price_observations", "stock_count", "INTEGER")?;
        Self::migrate_add_column_if_missing(&conn, "price_observations", "product_url", "TEXT")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn migrate_add_column_if_missing(
        conn: &Connection,
        table: &str,
        column: &str,
        column_def: &str,
    ) -> Result<(), StorageError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let existing_columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;

        if !existing_columns.iter().any(|c| c == column) {
            let alter_sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_def);
            conn.execute(&alter_sql, [])?;
        }

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn grouped_counts(
        &self,
        column: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(i64, usize)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {column}, COUNT(*) FROM price_observations
             WHERE observed_at >= ?1 AND observed_at <= ?2
             GROUP BY {column} ORDER BY {column}"
        ))?;
        let rows = stmt.query_map(params![format_datetime(&since), format_datetime(&until)], |row| {
            let id: i64 = row.get(0)?;
            let count: usize = row.get(1)?;
            Ok((id, count))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Inserts the variant if new (reactivating it otherwise) and returns its id.
    pub fn upsert_variant(&self, brand: &str, model_name: &str, storage: &str) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO product_variants (brand, model_name, storage) VALUES (?1, ?2, ?3)
             ON CONFLICT (brand, model_name, storage) DO UPDATE SET is_active = 1
             RETURNING id",
            params![brand, model_name, storage],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn upsert_marketplace(&self, name: &str, region: &str, base_url: &str) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        let id = conn.query_row(
            "INSERT INTO marketplaces (name, region, base_url) VALUES (?1, ?2, ?3)
             ON CONFLICT (name) DO UPDATE SET region = excluded.region, base_url = excluded.base_url, is_active = 1
             RETURNING id",
            params![name, region, base_url],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Saves a batch of observations in one transaction and returns their new ids.
    pub fn save_observations(&self, observations: &[PriceObservation]) -> Result<Vec<i64>, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(observations.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO price_observations (
                    variant_id, marketplace_id, condition, price, currency, price_usd,
                    available, stock_count, product_url, observed_at, session_id
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for obs in observations {
                stmt.execute(params![
                    obs.variant_id,
                    obs.marketplace_id,
                    obs.condition.as_str(),
                    obs.price,
                    obs.currency,
                    obs.price_usd,
                    obs.available,
                    obs.stock_count,
                    obs.product_url,
                    format_datetime(&obs.observed_at),
                    obs.session_id,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Observations whose USD price has not been filled in yet.
    pub fn pending_observations(&self) -> Result<Vec<PriceObservation>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM price_observations WHERE price_usd IS NULL ORDER BY id",
            OBSERVATION_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_observation)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Fills the USD price once. Returns false if it was already set.
    pub fn set_usd_price(&self, observation_id: i64, price_usd: f64) -> Result<bool, StorageError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE price_observations SET price_usd = ?2 WHERE id = ?1 AND price_usd IS NULL",
            params![observation_id, price_usd],
        )?;
        Ok(changed > 0)
    }

    pub fn purge_observations_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM price_observations WHERE observed_at < ?1",
            params![format_datetime(&cutoff)],
        )?;
        Ok(deleted)
    }

    pub fn save_snapshots(&self, snapshots: &[TrendSnapshot]) -> Result<usize, StorageError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO trend_snapshots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                SNAPSHOT_COLUMNS
            ))?;
            for s in snapshots {
                stmt.execute(params![
                    s.variant_id,
                    s.marketplace_id,
                    s.condition.as_str(),
                    s.period.as_str(),
                    format_datetime(&s.taken_at),
                    s.current_price_usd,
                    s.previous_price_usd,
                    s.price_change_amount,
                    s.price_change_percent,
                    s.avg_price,
                    s.min_price,
                    s.max_price,
                    s.volatility,
                ])?;
            }
        }
        tx.commit()?;
        Ok(snapshots.len())
    }

    pub fn latest_snapshot_time(&self, period: TrendPeriod) -> Result<Option<DateTime<Utc>>, StorageError> {
        let conn = self.conn()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(taken_at) FROM trend_snapshots WHERE period = ?1",
            params![period.as_str()],
            |row| row.get(0),
        )?;
        latest
            .map(|s| parse_datetime(&s).ok_or_else(|| StorageError::InvalidData(format!("bad snapshot time '{}'", s))))
            .transpose()
    }

    fn map_observation(row: &Row) -> Result<PriceObservation, rusqlite::Error> {
        let condition: String = row.get(3)?;
        let observed_at: String = row.get(10)?;

        Ok(PriceObservation {
            id: Some(row.get(0)?),
            variant_id: row.get(1)?,
            marketplace_id: row.get(2)?,
            condition: condition.parse().map_err(|e: String| conversion_error(3, e))?,
            price: row.get(4)?,
            currency: row.get(5)?,
            price_usd: row.get(6)?,
            available: row.get(7)?,
            stock_count: row.get(8)?,
            product_url: row.get(9)?,
            observed_at: parse_datetime(&observed_at)
                .ok_or_else(|| conversion_error(10, format!("bad timestamp '{}'", observed_at)))?,
            session_id: row.get(11)?,
        })
    }

    fn map_snapshot(row: &Row) -> Result<TrendSnapshot, rusqlite::Error> {
        let condition: String = row.get(2)?;
        let period: String = row.get(3)?;
        let taken_at: String = row.get(4)?;

        Ok(TrendSnapshot {
            variant_id: row.get(0)?,
            marketplace_id: row.get(1)?,
            condition: condition.parse().map_err(|e: String| conversion_error(2, e))?,
            period: period.parse().map_err(|e: String| conversion_error(3, e))?,
            taken_at: parse_datetime(&taken_at)
                .ok_or_else(|| conversion_error(4, format!("bad timestamp '{}'", taken_at)))?,
            current_price_usd: row.get(5)?,
            previous_price_usd: row.get(6)?,
            price_change_amount: row.get(7)?,
            price_change_percent: row.get(8)?,
            avg_price: row.get(9)?,
            min_price: row.get(10)?,
            max_price: row.get(11)?,
            volatility: row.get(12)?,
        })
    }
}

fn conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

impl ObservationStore for SqliteStorage {
    fn variant(&self, id: i64) -> Result<Option<ProductVariant>, StorageError> {
        let conn = self.conn()?;
        let variant = conn
            .query_row(
                "SELECT id, brand, model_name, storage, is_active FROM product_variants WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ProductVariant {
                        id: row.get(0)?,
                        brand: row.get(1)?,
                        model_name: row.get(2)?,
                        storage: row.get(3)?,
                        is_active: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(variant)
    }

    fn marketplace(&self, id: i64) -> Result<Option<Marketplace>, StorageError> {
        let conn = self.conn()?;
        let marketplace = conn
            .query_row(
                "SELECT id, name, region, base_url, is_active FROM marketplaces WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Marketplace {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        region: row.get(2)?,
                        base_url: row.get(3)?,
                        is_active: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(marketplace)
    }

    fn combination_history(
        &self,
        variant_id: i64,
        marketplace_id: i64,
        condition: Condition,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM price_observations
             WHERE variant_id = ?1 AND marketplace_id = ?2 AND condition = ?3
               AND observed_at >= ?4 AND observed_at <= ?5 AND price_usd IS NOT NULL
             ORDER BY observed_at ASC, id ASC",
            OBSERVATION_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![
                variant_id,
                marketplace_id,
                condition.as_str(),
                format_datetime(&since),
                format_datetime(&until)
            ],
            Self::map_observation,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn observations_between(
        &self,
        since: Option<DateTime<Utc>>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PriceObservation>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM price_observations
             WHERE (?1 IS NULL OR observed_at >= ?1) AND observed_at <= ?2
             ORDER BY observed_at ASC, id ASC",
            OBSERVATION_COLUMNS
        ))?;
        let since = since.as_ref().map(format_datetime);
        let rows = stmt.query_map(params![since, format_datetime(&until)], Self::map_observation)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn latest_observations(&self, until: DateTime<Utc>) -> Result<Vec<PriceObservation>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY variant_id, marketplace_id, condition
                    ORDER BY observed_at DESC, id DESC
                ) AS row_rank
                FROM price_observations WHERE observed_at <= ?1
             )
             WHERE row_rank = 1
             ORDER BY variant_id, condition, marketplace_id",
            OBSERVATION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![format_datetime(&until)], Self::map_observation)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn observation_count(&self, since: Option<DateTime<Utc>>, until: DateTime<Utc>) -> Result<usize, StorageError> {
        let conn = self.conn()?;
        let since = since.as_ref().map(format_datetime);
        let count: usize = conn.query_row(
            "SELECT COUNT(*) FROM price_observations WHERE (?1 IS NULL OR observed_at >= ?1) AND observed_at <= ?2",
            params![since, format_datetime(&until)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn counts_by_variant(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<(i64, usize)>, StorageError> {
        self.grouped_counts("variant_id", since, until)
    }

    fn counts_by_marketplace(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<(i64, usize)>, StorageError> {
        self.grouped_counts("marketplace_id", since, until)
    }

    fn brand_average_prices(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<BTreeMap<String, f64>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT v.brand, AVG(o.price_usd) FROM price_observations o
             JOIN product_variants v ON v.id = o.variant_id
             WHERE o.price_usd IS NOT NULL AND o.observed_at >= ?1 AND o.observed_at <= ?2
             GROUP BY v.brand",
        )?;
        let rows = stmt.query_map(params![format_datetime(&since), format_datetime(&until)], |row| {
            let brand: String = row.get(0)?;
            let average: f64 = row.get(1)?;
            Ok((brand, average))
        })?;

        let mut result = BTreeMap::new();
        for row in rows {
            let (brand, average) = row?;
            result.insert(brand, average);
        }
        Ok(result)
    }

    fn combinations(&self) -> Result<Vec<(i64, i64, Condition)>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT variant_id, marketplace_id, condition FROM price_observations
             ORDER BY variant_id, marketplace_id, condition",
        )?;
        let rows = stmt.query_map([], |row| {
            let variant_id: i64 = row.get(0)?;
            let marketplace_id: i64 = row.get(1)?;
            let condition: String = row.get(2)?;
            let condition: Condition = condition.parse().map_err(|e: String| conversion_error(2, e))?;
            Ok((variant_id, marketplace_id, condition))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl RateCache for SqliteStorage {
    fn latest_rate(
        &self,
        from: &str,
        to: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<ExchangeRateEntry>, StorageError> {
        let conn = self.conn()?;
        let since = since.as_ref().map(format_datetime);
        let row = conn
            .query_row(
                "SELECT from_currency, to_currency, rate, fetched_at, source FROM exchange_rates
                 WHERE from_currency = ?1 AND to_currency = ?2 AND (?3 IS NULL OR fetched_at >= ?3)
                 ORDER BY fetched_at DESC LIMIT 1",
                params![from, to, since],
                |row| {
                    let fetched_at: String = row.get(3)?;
                    Ok(ExchangeRateEntry {
                        from_currency: row.get(0)?,
                        to_currency: row.get(1)?,
                        rate: row.get(2)?,
                        fetched_at: parse_datetime(&fetched_at)
                            .ok_or_else(|| conversion_error(3, format!("bad timestamp '{}'", fetched_at)))?,
                        source: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn save_rate(&self, entry: &ExchangeRateEntry) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO exchange_rates (from_currency, to_currency, rate, fetched_at, source)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (from_currency, to_currency)
             DO UPDATE SET rate = excluded.rate, fetched_at = excluded.fetched_at, source = excluded.source",
            params![
                entry.from_currency,
                entry.to_currency,
                entry.rate,
                format_datetime(&entry.fetched_at),
                entry.source,
            ],
        )?;
        Ok(())
    }
}

impl SnapshotSource for SqliteStorage {
    fn snapshots_since(&self, since: DateTime<Utc>, period: TrendPeriod) -> Result<Vec<TrendSnapshot>, StorageError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM trend_snapshots WHERE period = ?1 AND taken_at >= ?2 ORDER BY taken_at ASC, id ASC",
            SNAPSHOT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![period.as_str(), format_datetime(&since)], Self::map_snapshot)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
