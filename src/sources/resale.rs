//! resale.rs - Lowest active resale listing per gift via a messaging-platform session
//!
//! The session itself (login, transport) is supplied by the host application;
//! this adapter only walks the gift catalog and samples resale listings.

use async_trait::async_trait;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::PriceSource;
use crate::config::ResaleConfig;
use crate::error::SourceError;
use crate::models::{Currency, RawPrice};

const NANOTONS_SCALE: u32 = 9;

/// A gift type from the platform catalog
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogGift {
    pub id: String,
    pub title: String,
}

/// Monetary amount as the platform encodes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypedAmount {
    Stars(i64),
    Ton { nanotons: i64 },
}

impl TypedAmount {
    pub fn to_price(self) -> (Decimal, Currency) {
        match self {
            TypedAmount::Stars(amount) => (Decimal::from(amount), Currency::Stars),
            TypedAmount::Ton { nanotons } => (Decimal::new(nanotons, NANOTONS_SCALE), Currency::Ton),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResaleListing {
    pub amount: TypedAmount,
}

/// Errors surfaced by the platform session
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("flood wait of {0}s requested")]
    FloodWait(u64),

    #[error("session invalid: {0}")]
    SessionInvalid(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: u16, message: String },

    #[error("session call timed out")]
    Timeout,
}

impl From<SessionError> for SourceError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::FloodWait(secs) => SourceError::rate_limited(
                Some(Duration::from_secs(secs)),
                format!("flood wait {}s", secs),
            ),
            SessionError::SessionInvalid(message) => SourceError::auth(message),
            SessionError::Rpc { code, message } => match code {
                401 => SourceError::auth(message),
                403 => SourceError::Forbidden(message),
                429 => SourceError::rate_limited(None, message),
                500..=599 => SourceError::server(code, message),
                _ => SourceError::transient(message),
            },
            SessionError::Timeout => SourceError::transient("session call timed out"),
        }
    }
}

/// Ready-to-use client session for the messaging platform
#[async_trait]
pub trait MarketSession: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<CatalogGift>, SessionError>;

    async fn fetch_resale_listings(
        &self,
        gift_id: &str,
        limit: usize,
    ) -> Result<Vec<ResaleListing>, SessionError>;
}

pub struct ResaleSource {
    session: Option<Arc<dyn MarketSession>>,
    enabled: bool,
    weight: u32,
    listings_per_item: usize,
    pacing_ms: (u64, u64),
    call_timeout: Duration,
}

impl ResaleSource {
    pub fn new(
        config: &ResaleConfig,
        session: Option<Arc<dyn MarketSession>>,
        call_timeout: Duration,
    ) -> Self {
        ResaleSource {
            enabled: config.enabled.unwrap_or(session.is_some()),
            session,
            weight: config.weight,
            listings_per_item: config.listings_per_item.max(1),
            pacing_ms: (150, 400),
            call_timeout,
        }
    }

    /// Random delay range inserted between per-gift listing queries
    pub fn with_pacing(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.pacing_ms = (min_ms, max_ms.max(min_ms));
        self
    }

    async fn pause(&self) {
        let (min, max) = self.pacing_ms;
        if max == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(fastrand::u64(min..=max))).await;
    }

    /// Bound a single session call; an expired call becomes `SessionError::Timeout`
    async fn bounded<T, F>(&self, call: F) -> Result<T, SessionError>
    where
        F: std::future::Future<Output = Result<T, SessionError>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or(Err(SessionError::Timeout))
    }

    /// Cheapest listing, preferring TON-priced listings over stars
    fn lowest(listings: &[ResaleListing]) -> Option<(Decimal, Currency)> {
        let prices: Vec<(Decimal, Currency)> = listings
            .iter()
            .map(|l| l.amount.to_price())
            .filter(|(price, _)| *price > Decimal::ZERO)
            .collect();

        let min_in = |currency: Currency| {
            prices
                .iter()
                .filter(|(_, c)| *c == currency)
                .map(|(p, _)| *p)
                .min()
                .map(|p| (p, currency))
        };

        min_in(Currency::Ton).or_else(|| min_in(Currency::Stars))
    }
}

#[async_trait]
impl PriceSource for ResaleSource {
    fn name(&self) -> &str {
        "resale"
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_prices(&self) -> Result<Vec<RawPrice>, SourceError> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| SourceError::Configuration("no market session supplied".to_string()))?;

        let catalog = self.bounded(session.fetch_catalog()).await?;
        debug!("Resale catalog contains {} gifts", catalog.len());

        let mut records = Vec::new();
        for (index, gift) in catalog.iter().enumerate() {
            if index > 0 {
                self.pause().await;
            }

            let listings = match self
                .bounded(session.fetch_resale_listings(&gift.id, self.listings_per_item))
                .await
            {
                Ok(listings) => listings,
                Err(e @ (SessionError::FloodWait(_) | SessionError::SessionInvalid(_))) => {
                    warn!("Resale scan aborted at '{}': {}", gift.title, e);
                    return Err(e.into());
                }
                Err(e) => {
                    debug!("Skipping resale listings for '{}': {}", gift.title, e);
                    continue;
                }
            };

            if let Some((price, currency)) = Self::lowest(&listings) {
                records.push(
                    RawPrice::new(price, currency)
                        .with_gift_id(gift.id.clone())
                        .with_name(gift.title.clone()),
                );
            }
        }

        info!("Resale source priced {} of {} gifts", records.len(), catalog.len());
        Ok(records)
    }
}
