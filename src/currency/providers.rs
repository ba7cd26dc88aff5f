use crate::config::{CurrencyConfig, ProviderKind};
use crate::model::ProviderError;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// A source of live exchange rates. Returns how many `to` units one `from` unit buys.
#[async_trait::async_trait]
pub trait RateProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct LatestRatesResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    rates: HashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    success: Option<bool>,
    result: Option<f64>,
}

fn rate_from_table(body: LatestRatesResponse, to: &str) -> Result<f64, ProviderError> {
    if body.success == Some(false) {
        return Err(ProviderError::Malformed("provider reported failure".into()));
    }
    body.rates
        .get(to)
        .copied()
        .ok_or_else(|| ProviderError::Malformed(format!("no rate for {}", to)))
}

fn rate_from_conversion(body: ConvertResponse) -> Result<f64, ProviderError> {
    if body.success != Some(true) {
        return Err(ProviderError::Malformed("conversion not successful".into()));
    }
    body.result
        .ok_or_else(|| ProviderError::Malformed("missing conversion result".into()))
}

async fn get_json<T: serde::de::DeserializeOwned>(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
) -> Result<T, ProviderError> {
    let response = client.get(url).query(query).send().await?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Malformed(e.to_string()))
}

/// exchangerate-api.com, free tier, no key.
pub struct ExchangeRateApiProvider {
    client: Client,
}

#[async_trait::async_trait]
impl RateProvider for ExchangeRateApiProvider {
    fn name(&self) -> &str {
        "exchangerate-api"
    }

    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64, ProviderError> {
        let url = format!("https://api.exchangerate-api.com/v4/latest/{}", from);
        let body: LatestRatesResponse = get_json(&self.client, &url, &[]).await?;
        rate_from_table(body, to)
    }
}

/// fixer.io, needs an access key.
pub struct FixerProvider {
    client: Client,
    api_key: Option<String>,
}

#[async_trait::async_trait]
impl RateProvider for FixerProvider {
    fn name(&self) -> &str {
        "fixer"
    }

    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64, ProviderError> {
        let api_key = self.api_key.as_deref().ok_or(ProviderError::MissingKey)?;
        let body: LatestRatesResponse = get_json(
            &self.client,
            "http://data.fixer.io/api/latest",
            &[("access_key", api_key), ("base", from), ("symbols", to)],
        )
        .await?;
        rate_from_table(body, to)
    }
}

/// exchangerate.host conversion endpoint.
pub struct ExchangeRateHostProvider {
    client: Client,
}

#[async_trait::async_trait]
impl RateProvider for ExchangeRateHostProvider {
    fn name(&self) -> &str {
        "exchangerate-host"
    }

    async fn fetch_rate(&self, from: &str, to: &str) -> Result<f64, ProviderError> {
        let body: ConvertResponse = get_json(
            &self.client,
            "https://api.exchangerate.host/convert",
            &[("from", from), ("to", to), ("amount", "1")],
        )
        .await?;
        rate_from_conversion(body)
    }
}

/// Builds the configured providers, in priority order, sharing one HTTP client.
pub fn build_providers(config: &CurrencyConfig) -> Result<Vec<Box<dyn RateProvider>>, ProviderError> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.provider_timeout_seconds))
        .user_agent("resale-pulse/0.1")
        .build()?;

    let providers = config
        .providers
        .iter()
        .map(|kind| -> Box<dyn RateProvider> {
            match kind {
                ProviderKind::ExchangerateApi => Box::new(ExchangeRateApiProvider { client: client.clone() }),
                ProviderKind::Fixer => Box::new(FixerProvider {
                    client: client.clone(),
                    api_key: config.fixer_api_key.clone(),
                }),
                ProviderKind::ExchangerateHost => Box::new(ExchangeRateHostProvider { client: client.clone() }),
            }
        })
        .collect();

    Ok(providers)
}
