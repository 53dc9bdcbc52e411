//! aggregator.rs - Cross-marketplace floor prices from a single aggregator API

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use super::{decimal_from_value, retry_after, PriceSource};
use crate::config::AggregatorConfig;
use crate::error::SourceError;
use crate::models::{Currency, RawPrice};

/// Marketplace floor fields reported per gift, all in TON
pub const MARKETPLACE_FIELDS: [&str; 5] = ["portals", "tonnel", "mrkt", "getgems", "fragment"];

#[derive(Debug, Clone)]
pub struct AggregatorSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    enabled: bool,
    weight: u32,
}

impl AggregatorSource {
    pub fn new(config: &AggregatorConfig, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        AggregatorSource {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            enabled: config.enabled.unwrap_or(config.api_key.is_some()),
            weight: config.weight,
        }
    }

    /// Convert the `{ "<gift name>": { "<marketplace>": floor, ... } }` map
    ///
    /// Entries may carry an `id` field; gifts without any positive floor are skipped.
    pub fn parse_floor_map(body: &Value, fetched_at: i64) -> Result<Vec<RawPrice>, SourceError> {
        let map = body
            .get("floors")
            .unwrap_or(body)
            .as_object()
            .ok_or_else(|| SourceError::transient("aggregator payload is not an object"))?;

        let mut records = Vec::with_capacity(map.len());
        for (name, floors) in map {
            let lowest = MARKETPLACE_FIELDS
                .iter()
                .filter_map(|field| floors.get(*field).and_then(decimal_from_value))
                .filter(|price| *price > Decimal::ZERO)
                .min();

            let Some(price) = lowest else {
                debug!("No usable floor for '{}'", name);
                continue;
            };

            let mut record = RawPrice::new(price, Currency::Ton)
                .with_name(name.clone())
                .with_ts(fetched_at);
            match floors.get("id") {
                Some(Value::String(id)) => record = record.with_gift_id(id.clone()),
                Some(Value::Number(id)) => record = record.with_gift_id(id.to_string()),
                _ => {}
            }
            records.push(record);
        }

        Ok(records)
    }
}

#[async_trait]
impl PriceSource for AggregatorSource {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_prices(&self) -> Result<Vec<RawPrice>, SourceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| SourceError::Configuration("AGGREGATOR_API_KEY is not set".to_string()))?;

        debug!("Fetching floors from: {}", self.base_url);
        let response = self
            .client
            .get(&self.base_url)
            .bearer_auth(api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(
                status.as_u16(),
                retry_after(response.headers()),
                "aggregator",
            ));
        }

        let body: Value = response.json().await?;
        let records = Self::parse_floor_map(&body, chrono::Utc::now().timestamp_millis())?;
        info!("Aggregator returned floors for {} gifts", records.len());
        Ok(records)
    }
}
