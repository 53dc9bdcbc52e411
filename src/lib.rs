//! Gift Price Cache
//!
//! Reconciles gift prices from several unreliable providers into one
//! canonical, queryable cache that survives restarts via a JSON snapshot.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   PriceManager                       │
//! │  - init() / stop()                                   │
//! │  - get_price(id_or_name) / get_all_prices()          │
//! │  - refresh({force, reason})  (single flight)         │
//! └───────┬──────────────────┬──────────────────┬───────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//! ┌───────────────┐  ┌───────────────┐  ┌───────────────┐
//! │ PriceSource   │  │ SourceHealth  │  │ SnapshotStore │
//! │ resale        │  │ backoff tiers │  │ atomic save   │
//! │ aggregator    │  │ health score  │  │ validated load│
//! │ onchain       │  └───────────────┘  └───────────────┘
//! └───────────────┘
//!         │
//!         ▼
//!   keys: canonical key + alias index
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod keys;
pub mod manager;
pub mod models;
pub mod snapshot;
pub mod sources;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use error::{ConfigError, SnapshotError, SourceError};
pub use health::SourceHealth;
pub use manager::{PriceManager, ProviderReport, RefreshOptions, RefreshOutcome, RefreshStatus};
pub use models::{Currency, PriceEntry, PriceLookup, RawPrice};
pub use snapshot::{Snapshot, SnapshotStore};
pub use sources::{build_sources, MarketSession, MockPriceSource, PriceSource};

/// Version of the price cache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the package
pub const NAME: &str = env!("CARGO_PKG_NAME");
