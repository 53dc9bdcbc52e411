//! onchain.rs - Floor prices from listed items of on-chain NFT collections
//!
//! Pages through each configured collection and keeps the cheapest sale that
//! is priced in the chain's base currency.

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use super::{retry_after, PriceSource};
use crate::config::OnChainConfig;
use crate::error::SourceError;
use crate::models::{Currency, RawPrice};

const BASE_TOKEN: &str = "TON";
const NANOTONS_SCALE: u32 = 9;

// ============================================================================
// Indexer API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct ItemsPage {
    #[serde(default)]
    nft_items: Vec<NftItem>,
}

#[derive(Debug, Deserialize)]
struct NftItem {
    sale: Option<Sale>,
}

#[derive(Debug, Deserialize)]
struct Sale {
    price: SalePrice,
}

#[derive(Debug, Deserialize)]
struct SalePrice {
    value: String,
    token_name: String,
}

#[derive(Debug, Clone)]
pub struct OnChainSource {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    collections: BTreeMap<String, String>,
    page_size: usize,
    max_pages: usize,
    enabled: bool,
    weight: u32,
}

impl OnChainSource {
    pub fn new(config: &OnChainConfig, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        OnChainSource {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            collections: config.collections.clone(),
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
            enabled: config.enabled.unwrap_or(!config.collections.is_empty()),
            weight: config.weight,
        }
    }

    /// Cheapest base-currency sale on a page, converted from nanotons
    fn page_minimum(page: &ItemsPage) -> Option<Decimal> {
        page.nft_items
            .iter()
            .filter_map(|item| item.sale.as_ref())
            .filter(|sale| sale.price.token_name.eq_ignore_ascii_case(BASE_TOKEN))
            .filter_map(|sale| i64::from_str(sale.price.value.trim()).ok())
            .filter(|nanotons| *nanotons > 0)
            .map(|nanotons| Decimal::new(nanotons, NANOTONS_SCALE))
            .min()
    }

    async fn fetch_page(&self, address: &str, offset: usize) -> Result<ItemsPage, SourceError> {
        let url = format!("{}/v2/nfts/collections/{}/items", self.base_url, address);
        debug!("Fetching from: {} (offset {})", url, offset);

        let mut request = self.client.get(&url).query(&[
            ("limit", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::from_status(
                status.as_u16(),
                retry_after(response.headers()),
                "onchain indexer",
            ));
        }

        Ok(response.json::<ItemsPage>().await?)
    }

    async fn collection_floor(&self, address: &str) -> Result<Option<Decimal>, SourceError> {
        let mut floor: Option<Decimal> = None;

        for page_index in 0..self.max_pages {
            let page = self.fetch_page(address, page_index * self.page_size).await?;
            if let Some(min) = Self::page_minimum(&page) {
                floor = Some(floor.map_or(min, |current| current.min(min)));
            }
            if page.nft_items.len() < self.page_size {
                break;
            }
        }

        Ok(floor)
    }
}

#[async_trait]
impl PriceSource for OnChainSource {
    fn name(&self) -> &str {
        "onchain"
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_prices(&self) -> Result<Vec<RawPrice>, SourceError> {
        if self.collections.is_empty() {
            return Err(SourceError::Configuration(
                "ONCHAIN_COLLECTIONS is empty".to_string(),
            ));
        }

        let mut records = Vec::new();
        let mut failures = 0usize;
        let mut last_error = None;
        for (name, address) in &self.collections {
            match self.collection_floor(address).await {
                Ok(Some(price)) => records.push(
                    RawPrice::new(price, Currency::Ton)
                        .with_name(name.clone())
                        .with_alias(address.clone())
                        .with_ts(chrono::Utc::now().timestamp_millis()),
                ),
                Ok(None) => debug!("No TON listings found for collection '{}'", name),
                Err(e) => {
                    warn!("Skipping collection '{}': {}", name, e);
                    failures += 1;
                    last_error = Some(e);
                }
            }
        }

        if failures == self.collections.len() {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        info!(
            "On-chain source priced {} of {} collections",
            records.len(),
            self.collections.len()
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(value: &str, token: &str) -> serde_json::Value {
        serde_json::json!({"address": "0:abc", "sale": {"price": {"value": value, "token_name": token}}})
    }

    #[test]
    fn test_page_minimum_filters_to_base_currency() {
        let page: ItemsPage = serde_json::from_value(serde_json::json!({
            "nft_items": [
                item("15000000000", "TON"),
                item("1000", "USDT"),
                item("7500000000", "TON"),
                {"address": "0:def"},
                item("garbage", "TON")
            ]
        }))
        .unwrap();

        assert_eq!(OnChainSource::page_minimum(&page), Some(dec!(7.5)));
    }

    #[tokio::test]
    async fn test_pages_until_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/nfts/collections/EQpepe/items"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nft_items": [item("20000000000", "TON"), item("30000000000", "TON")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/nfts/collections/EQpepe/items"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nft_items": [item("12000000000", "TON")]
            })))
            .mount(&server)
            .await;

        let mut collections = BTreeMap::new();
        collections.insert("Plush Pepe".to_string(), "EQpepe".to_string());
        let source = OnChainSource::new(
            &OnChainConfig {
                base_url: server.uri(),
                collections,
                page_size: 2,
                ..OnChainConfig::default()
            },
            Duration::from_secs(5),
        );
        assert!(source.enabled());

        let records = source.fetch_prices().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].price, dec!(12));
        assert_eq!(records[0].name.as_deref(), Some("Plush Pepe"));
        assert_eq!(records[0].aliases, vec!["EQpepe".to_string()]);
    }

    #[tokio::test]
    async fn test_server_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut collections = BTreeMap::new();
        collections.insert("Plush Pepe".to_string(), "EQpepe".to_string());
        let source = OnChainSource::new(
            &OnChainConfig {
                base_url: server.uri(),
                collections,
                ..OnChainConfig::default()
            },
            Duration::from_secs(5),
        );

        let err = source.fetch_prices().await.unwrap_err();
        assert!(matches!(err, SourceError::Server { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_failing_collection_does_not_discard_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/nfts/collections/EQbroken/items"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/nfts/collections/EQpepe/items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "nft_items": [item("8000000000", "TON")]
            })))
            .mount(&server)
            .await;

        let mut collections = BTreeMap::new();
        collections.insert("Broken Set".to_string(), "EQbroken".to_string());
        collections.insert("Plush Pepe".to_string(), "EQpepe".to_string());
        let source = OnChainSource::new(
            &OnChainConfig {
                base_url: server.uri(),
                collections,
                ..OnChainConfig::default()
            },
            Duration::from_secs(5),
        );

        let records = source.fetch_prices().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name.as_deref(), Some("Plush Pepe"));
        assert_eq!(records[0].price, dec!(8));
    }

    #[test]
    fn test_disabled_without_collections() {
        let source = OnChainSource::new(&OnChainConfig::default(), Duration::from_secs(5));
        assert!(!source.enabled());
    }
}
