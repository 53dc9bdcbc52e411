//! sources - Price source contract and provider adapters
//!
//! Each provider is a distinct type behind [`PriceSource`]. Whether a source is
//! enabled is decided once, from configuration, when the adapter is built.

use async_trait::async_trait;
use log::debug;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::SourceError;
use crate::models::RawPrice;

pub mod aggregator;
pub mod onchain;
pub mod resale;

pub use aggregator::AggregatorSource;
pub use onchain::OnChainSource;
pub use resale::{MarketSession, ResaleSource};

/// Trait implemented by every external price provider
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Stable provider name used for health tracking and provenance
    fn name(&self) -> &str;

    /// Trust priority; higher weights win merges
    fn weight(&self) -> u32;

    fn enabled(&self) -> bool;

    /// Fetch fresh candidate records or fail with a classified error
    async fn fetch_prices(&self) -> Result<Vec<RawPrice>, SourceError>;
}

/// Build every configured source, ordered as declared
pub fn build_sources(
    config: &CacheConfig,
    session: Option<Arc<dyn MarketSession>>,
) -> Vec<Arc<dyn PriceSource>> {
    vec![
        Arc::new(ResaleSource::new(&config.resale, session, config.fetch_timeout)),
        Arc::new(AggregatorSource::new(&config.aggregator, config.fetch_timeout)),
        Arc::new(OnChainSource::new(&config.onchain, config.fetch_timeout)),
    ]
}

/// Parse a `Retry-After` header given in seconds
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Read a price given either as a JSON number or a numeric string
pub(crate) fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

// ============================================================================
// MockPriceSource - For testing purposes
// ============================================================================

/// Scripted source that replays queued results and counts calls
pub struct MockPriceSource {
    name: String,
    weight: u32,
    enabled: bool,
    delay: Duration,
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Vec<RawPrice>, SourceError>>>,
    fallback: Result<Vec<RawPrice>, SourceError>,
}

impl MockPriceSource {
    pub fn new(name: &str, weight: u32) -> Self {
        MockPriceSource {
            name: name.to_string(),
            weight,
            enabled: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(Vec::new()),
        }
    }

    /// Result returned whenever the script is exhausted
    pub fn returning(mut self, result: Result<Vec<RawPrice>, SourceError>) -> Self {
        self.fallback = result;
        self
    }

    /// Queue a one-shot result served before the fallback
    pub fn then(self, result: Result<Vec<RawPrice>, SourceError>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceSource for MockPriceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_prices(&self) -> Result<Vec<RawPrice>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("MockPriceSource '{}' fetch called", self.name);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
