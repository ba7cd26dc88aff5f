use crate::currency::CurrencyNormalizer;
use crate::model::{PriceObservation, StorageError};
use crate::storage::{RateCache, SqliteStorage};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizationReport {
    pub converted: usize,
    pub unresolved: usize,
}

/// Fills `price_usd` on every observation that does not have one yet.
/// Observations whose currency cannot be resolved are left as they are.
pub async fn normalize_all<C: RateCache>(
    observations: &mut [PriceObservation],
    currency: &CurrencyNormalizer<C>,
) -> NormalizationReport {
    let items: Vec<(f64, String, usize)> = observations
        .iter()
        .enumerate()
        .filter(|(_, o)| o.price_usd.is_none())
        .map(|(index, o)| (o.price, o.currency.clone(), index))
        .collect();

    let mut report = NormalizationReport::default();
    for (index, usd) in currency.bulk_convert(&items).await {
        match usd {
            Some(value) => {
                observations[index].price_usd = Some(value);
                report.converted += 1;
            }
            None => report.unresolved += 1,
        }
    }
    report
}

/// Normalizes every stored observation still missing a USD price.
pub async fn normalize_pending<C: RateCache>(
    storage: &SqliteStorage,
    currency: &CurrencyNormalizer<C>,
) -> Result<NormalizationReport, StorageError> {
    let mut pending = storage.pending_observations()?;
    if pending.is_empty() {
        return Ok(NormalizationReport::default());
    }

    info!("Normalizing {} pending observations...", pending.len());
    let report = normalize_all(&mut pending, currency).await;

    for obs in &pending {
        if let (Some(id), Some(usd)) = (obs.id, obs.price_usd) {
            storage.set_usd_price(id, usd)?;
        }
    }

    if report.unresolved > 0 {
        warn!("{} observations left unconverted", report.unresolved);
    }
    Ok(report)
}
