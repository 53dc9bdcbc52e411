//! config.rs - Runtime configuration loaded from environment variables

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_STALE_MAX_SECS: u64 = 900;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_SOURCE_DEADLINE_SECS: u64 = 1800;
pub const DEFAULT_SNAPSHOT_PATH: &str = "data/price-cache.json";

pub const DEFAULT_AGGREGATOR_URL: &str = "https://api.giftfloors.io/v1/floors";
pub const DEFAULT_ONCHAIN_URL: &str = "https://tonapi.io";

/// Resale-listing source settings; credentials live in the supplied session
#[derive(Debug, Clone, PartialEq)]
pub struct ResaleConfig {
    pub enabled: Option<bool>,
    pub weight: u32,
    pub listings_per_item: usize,
}

impl Default for ResaleConfig {
    fn default() -> Self {
        ResaleConfig {
            enabled: None,
            weight: 90,
            listings_per_item: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    pub enabled: Option<bool>,
    pub weight: u32,
    pub api_key: Option<String>,
    pub base_url: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            enabled: None,
            weight: 70,
            api_key: None,
            base_url: DEFAULT_AGGREGATOR_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnChainConfig {
    pub enabled: Option<bool>,
    pub weight: u32,
    pub api_key: Option<String>,
    pub base_url: String,
    /// Display name -> collection address
    pub collections: BTreeMap<String, String>,
    pub page_size: usize,
    pub max_pages: usize,
}

impl Default for OnChainConfig {
    fn default() -> Self {
        OnChainConfig {
            enabled: None,
            weight: 50,
            api_key: None,
            base_url: DEFAULT_ONCHAIN_URL.to_string(),
            collections: BTreeMap::new(),
            page_size: 100,
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub refresh_interval: Duration,
    pub stale_max: Duration,
    /// Timeout applied to each network request or session call
    pub fetch_timeout: Duration,
    /// Upper bound on one source's whole fetch, however many calls it makes
    pub source_deadline: Duration,
    pub snapshot_path: PathBuf,
    pub resale: ResaleConfig,
    pub aggregator: AggregatorConfig,
    pub onchain: OnChainConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            stale_max: Duration::from_secs(DEFAULT_STALE_MAX_SECS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            source_deadline: Duration::from_secs(DEFAULT_SOURCE_DEADLINE_SECS),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            resale: ResaleConfig::default(),
            aggregator: AggregatorConfig::default(),
            onchain: OnChainConfig::default(),
        }
    }
}

fn parse_secs(name: &str, value: Option<String>, default: u64) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value: raw,
            }),
    }
}

fn parse_flag(name: &str, value: Option<String>) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = value else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: raw,
        }),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CacheConfig::default();

        let collections = match non_empty(lookup("ONCHAIN_COLLECTIONS")) {
            Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(&raw).map_err(
                |source| ConfigError::InvalidJson {
                    name: "ONCHAIN_COLLECTIONS".to_string(),
                    source,
                },
            )?,
            None => BTreeMap::new(),
        };

        Ok(CacheConfig {
            refresh_interval: parse_secs(
                "PRICE_CACHE_REFRESH_INTERVAL_SECS",
                lookup("PRICE_CACHE_REFRESH_INTERVAL_SECS"),
                DEFAULT_REFRESH_INTERVAL_SECS,
            )?,
            stale_max: parse_secs(
                "PRICE_CACHE_STALE_MAX_SECS",
                lookup("PRICE_CACHE_STALE_MAX_SECS"),
                DEFAULT_STALE_MAX_SECS,
            )?,
            fetch_timeout: parse_secs(
                "PRICE_CACHE_FETCH_TIMEOUT_SECS",
                lookup("PRICE_CACHE_FETCH_TIMEOUT_SECS"),
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?,
            source_deadline: parse_secs(
                "PRICE_CACHE_SOURCE_DEADLINE_SECS",
                lookup("PRICE_CACHE_SOURCE_DEADLINE_SECS"),
                DEFAULT_SOURCE_DEADLINE_SECS,
            )?,
            snapshot_path: non_empty(lookup("PRICE_CACHE_SNAPSHOT_PATH"))
                .map(PathBuf::from)
                .unwrap_or(defaults.snapshot_path),
            resale: ResaleConfig {
                enabled: parse_flag("RESALE_SOURCE_ENABLED", lookup("RESALE_SOURCE_ENABLED"))?,
                ..defaults.resale
            },
            aggregator: AggregatorConfig {
                enabled: parse_flag(
                    "AGGREGATOR_SOURCE_ENABLED",
                    lookup("AGGREGATOR_SOURCE_ENABLED"),
                )?,
                api_key: non_empty(lookup("AGGREGATOR_API_KEY")),
                base_url: non_empty(lookup("AGGREGATOR_API_URL"))
                    .unwrap_or(defaults.aggregator.base_url),
                ..defaults.aggregator
            },
            onchain: OnChainConfig {
                enabled: parse_flag("ONCHAIN_SOURCE_ENABLED", lookup("ONCHAIN_SOURCE_ENABLED"))?,
                api_key: non_empty(lookup("ONCHAIN_API_KEY")),
                base_url: non_empty(lookup("ONCHAIN_API_URL"))
                    .unwrap_or(defaults.onchain.base_url),
                collections,
                ..defaults.onchain
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = CacheConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.refresh_interval, Duration::from_secs(300));
        assert_eq!(config.aggregator.api_key, None);
    }

    #[test]
    fn test_reads_overrides_and_collections() {
        let config = CacheConfig::from_lookup(lookup_from(&[
            ("PRICE_CACHE_REFRESH_INTERVAL_SECS", "60"),
            ("PRICE_CACHE_SOURCE_DEADLINE_SECS", "600"),
            ("PRICE_CACHE_SNAPSHOT_PATH", "/tmp/prices.json"),
            ("AGGREGATOR_API_KEY", "secret"),
            ("RESALE_SOURCE_ENABLED", "off"),
            ("ONCHAIN_COLLECTIONS", r#"{"Plush Pepe": "EQabc"}"#),
        ]))
        .unwrap();

        assert_eq!(config.refresh_interval, Duration::from_secs(60));
        assert_eq!(config.source_deadline, Duration::from_secs(600));
        assert_eq!(config.fetch_timeout, Duration::from_secs(15));
        assert_eq!(config.snapshot_path, PathBuf::from("/tmp/prices.json"));
        assert_eq!(config.aggregator.api_key.as_deref(), Some("secret"));
        assert_eq!(config.resale.enabled, Some(false));
        assert_eq!(
            config.onchain.collections.get("Plush Pepe").map(String::as_str),
            Some("EQabc")
        );
    }

    #[test]
    fn test_rejects_malformed_values() {
        let bad_number =
            CacheConfig::from_lookup(lookup_from(&[("PRICE_CACHE_STALE_MAX_SECS", "soon")]));
        assert!(matches!(bad_number, Err(ConfigError::InvalidValue { .. })));

        let bad_json = CacheConfig::from_lookup(lookup_from(&[("ONCHAIN_COLLECTIONS", "[1,2")]));
        assert!(matches!(bad_json, Err(ConfigError::InvalidJson { .. })));
    }
}
