use crate::model::BASE_CURRENCY;
use std::collections::BTreeMap;

/// Static last-resort table of currency units per one USD.
#[derive(Debug, Clone)]
pub struct FallbackRates {
    rates: BTreeMap<String, f64>,
}

impl FallbackRates {
    pub fn new(rates: BTreeMap<String, f64>) -> Self {
        let mut rates = rates;
        rates.entry(BASE_CURRENCY.to_string()).or_insert(1.0);
        Self { rates }
    }

    /// Rate for `from -> to`, crossing through USD when neither side is USD.
    pub fn rate(&self, from: &str, to: &str) -> Option<f64> {
        if from == to {
            return Some(1.0);
        }

        let from_rate = *self.rates.get(from)?;
        if to == BASE_CURRENCY {
            Some(1.0 / from_rate)
        } else {
            let to_rate = *self.rates.get(to)?;
            Some(to_rate / from_rate)
        }
    }

    pub fn units_per_usd(&self, currency: &str) -> Option<f64> {
        self.rates.get(currency).copied()
    }

    pub fn set_units_per_usd(&mut self, currency: &str, units: f64) {
        self.rates.insert(currency.to_string(), units);
    }

    pub fn currencies(&self) -> Vec<String> {
        self.rates.keys().cloned().collect()
    }
}
