//! models.rs - Core data structures for the price cache
//!
//! Defines Currency, PriceEntry and the raw candidate records sources return

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency a gift price is quoted in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Currency {
    #[serde(rename = "TON")]
    Ton,
    #[serde(rename = "STARS")]
    Stars,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Ton => "TON",
            Currency::Stars => "STARS",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TON" => Ok(Currency::Ton),
            // XTR is the ISO-style code the messaging platform uses for stars
            "STARS" | "STAR" | "XTR" => Ok(Currency::Stars),
            other => Err(format!("unknown currency: {}", other)),
        }
    }
}

/// A validated, cached price for one canonical key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntry {
    pub price: Decimal,
    pub currency: Currency,
    pub source: String,
    /// Fetch timestamp, ms since epoch
    pub ts: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub gift_id: Option<String>,
}

impl PriceEntry {
    pub fn is_valid(&self) -> bool {
        self.price > Decimal::ZERO
    }
}

impl fmt::Display for PriceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} via {}", self.price, self.currency, self.source)
    }
}

/// Unvalidated candidate record as returned by a price source
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPrice {
    pub key: Option<String>,
    pub gift_id: Option<String>,
    pub name: Option<String>,
    pub aliases: Vec<String>,
    pub price: Decimal,
    /// Free-form currency text, validated during normalization
    pub currency: String,
    pub ts: Option<i64>,
}

impl RawPrice {
    pub fn new(price: Decimal, currency: Currency) -> Self {
        RawPrice {
            price,
            currency: currency.as_str().to_string(),
            ..RawPrice::default()
        }
    }

    pub fn with_gift_id(mut self, gift_id: impl Into<String>) -> Self {
        self.gift_id = Some(gift_id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = Some(ts);
        self
    }
}

/// Result of a price lookup
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLookup {
    pub key: String,
    pub entry: PriceEntry,
    pub stale: bool,
}
