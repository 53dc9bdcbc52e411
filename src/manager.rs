//! manager.rs - Price manager orchestrating sources, merge, backoff and persistence
//!
//! All cache state lives behind one `PriceManager`. Reads never touch the
//! network; at most one refresh cycle runs at a time and concurrent callers
//! share its result.

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, RwLock};
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::SourceError;
use crate::health::{SourceHealth, STATUS_COOLDOWN, STATUS_DISABLED, STATUS_OK};
use crate::keys::{collect_aliases, normalize_canonical_key, rebuild_aliases, resolve_key};
use crate::models::{Currency, PriceEntry, PriceLookup, RawPrice};
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::sources::PriceSource;

/// Lower bound on the delay between scheduled refreshes
pub const MIN_RESCHEDULE_MS: i64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOptions {
    pub force: bool,
    pub reason: String,
}

impl RefreshOptions {
    pub fn forced(reason: &str) -> Self {
        RefreshOptions {
            force: true,
            reason: reason.to_string(),
        }
    }

    pub fn if_due(reason: &str) -> Self {
        RefreshOptions {
            force: false,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// Not forced and not due
    Skipped,
    /// Every enabled source contributed
    Complete,
    Partial,
    /// No source contributed; the previous cache is served
    Stale,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Skipped => "skipped",
            RefreshStatus::Complete => "ok",
            RefreshStatus::Partial => "partial",
            RefreshStatus::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub name: String,
    pub status: String,
    pub count: usize,
    pub error: Option<String>,
}

impl SourceOutcome {
    fn new(name: &str, status: &str, count: usize, error: Option<String>) -> Self {
        SourceOutcome {
            name: name.to_string(),
            status: status.to_string(),
            count,
            error,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub status: RefreshStatus,
    pub reason: String,
    pub started_at: i64,
    pub updated_at: i64,
    pub price_count: usize,
    pub sources: Vec<SourceOutcome>,
}

/// Observability view of one source
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReport {
    pub name: String,
    pub enabled: bool,
    pub in_cooldown: bool,
    pub score: u8,
    pub health: SourceHealth,
}

#[derive(Debug, Default)]
struct CacheState {
    updated_at: i64,
    /// Start of the most recent refresh run in this process
    last_attempt_at: i64,
    prices: HashMap<String, PriceEntry>,
    aliases: HashMap<String, String>,
    health: HashMap<String, SourceHealth>,
}

impl CacheState {
    fn is_stale(&self, now: i64, stale_max: Duration) -> bool {
        self.updated_at <= 0 || now - self.updated_at > stale_max.as_millis() as i64
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            updated_at: self.updated_at,
            prices: self.prices.clone(),
            aliases: self.aliases.clone(),
            provider_stats: self.health.clone(),
        }
    }
}

type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct ManagerInner {
    config: CacheConfig,
    sources: Vec<Arc<dyn PriceSource>>,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
    next_refresh_at: AtomicI64,
    loaded: OnceCell<()>,
    stopped: AtomicBool,
    in_flight: Mutex<Option<PendingRefresh>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the in-flight slot when a refresh task ends, even by panic
struct InFlightGuard(Arc<ManagerInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.0.in_flight).take();
    }
}

/// Validate a candidate and turn it into a cache entry with its aliases
pub fn normalize_record(
    raw: RawPrice,
    source: &str,
    fetched_at: i64,
) -> Option<(String, PriceEntry, Vec<String>)> {
    if raw.price <= Decimal::ZERO {
        return None;
    }
    let currency: Currency = raw.currency.parse().ok()?;
    let key = normalize_canonical_key(&raw)?;
    let aliases = collect_aliases(&raw);

    let entry = PriceEntry {
        price: raw.price,
        currency,
        source: source.to_string(),
        ts: raw.ts.unwrap_or(fetched_at),
        name: raw.name.filter(|n| !n.trim().is_empty()),
        gift_id: raw
            .gift_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty()),
    };
    Some((key, entry, aliases))
}

/// Merge rule: higher weight wins, then strictly newer timestamp; exact ties
/// keep whatever was there first
pub fn should_replace(existing: Option<(u32, i64)>, candidate: (u32, i64)) -> bool {
    match existing {
        None => true,
        Some((weight, ts)) => candidate.0 > weight || (candidate.0 == weight && candidate.1 > ts),
    }
}

fn merge_candidate<W>(
    table: &mut HashMap<String, PriceEntry>,
    key: String,
    entry: PriceEntry,
    weight_of: W,
) where
    W: Fn(&str) -> u32,
{
    let existing = table.get(&key).map(|e| (weight_of(&e.source), e.ts));
    if should_replace(existing, (weight_of(&entry.source), entry.ts)) {
        table.insert(key, entry);
    }
}

/// Cheap-to-clone handle to the shared price cache
#[derive(Clone)]
pub struct PriceManager {
    inner: Arc<ManagerInner>,
}

impl PriceManager {
    pub fn new(config: CacheConfig, sources: Vec<Arc<dyn PriceSource>>) -> Self {
        Self::with_clock(config, sources, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        mut sources: Vec<Arc<dyn PriceSource>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        // Stable: equal weights keep their declared order
        sources.sort_by_key(|s| std::cmp::Reverse(s.weight()));

        let health = sources
            .iter()
            .map(|s| (s.name().to_string(), SourceHealth::new(s.weight())))
            .collect();

        PriceManager {
            inner: Arc::new(ManagerInner {
                store: SnapshotStore::new(config.snapshot_path.clone()),
                config,
                sources,
                clock,
                state: RwLock::new(CacheState {
                    health,
                    ..CacheState::default()
                }),
                next_refresh_at: AtomicI64::new(0),
                loaded: OnceCell::new(),
                stopped: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Load the last snapshot (once) and arm the refresh timer
    pub async fn init(&self) {
        self.ensure_loaded().await;
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.schedule_next().await;
    }

    /// Restore the persisted snapshot the first time anything needs state
    async fn ensure_loaded(&self) {
        self.inner
            .loaded
            .get_or_init(|| async {
                match self.inner.store.load().await {
                    Ok(Some(snapshot)) => self.restore(snapshot).await,
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring unreadable snapshot: {}", e),
                }
            })
            .await;
    }

    async fn restore(&self, snapshot: Snapshot) {
        let mut state = self.inner.state.write().await;
        state.updated_at = snapshot.updated_at;
        state.prices = snapshot.prices;
        state.aliases = snapshot.aliases;

        for source in &self.inner.sources {
            if let Some(saved) = snapshot.provider_stats.get(source.name()) {
                let mut health = saved.clone();
                health.weight = source.weight();
                state.health.insert(source.name().to_string(), health);
            }
        }

        info!(
            "Restored {} prices (updated at {})",
            state.prices.len(),
            state.updated_at
        );
    }

    /// Cancel the refresh timer; reads keep serving from memory
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.abort();
        }
        debug!("Price manager stopped");
    }

    fn is_due(&self) -> bool {
        self.inner.clock.now_ms() >= self.inner.next_refresh_at.load(Ordering::SeqCst)
    }

    pub async fn is_stale(&self) -> bool {
        let now = self.inner.clock.now_ms();
        self.inner
            .state
            .read()
            .await
            .is_stale(now, self.inner.config.stale_max)
    }

    fn refresh_in_background_if_due(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) || !self.is_due() {
            return;
        }
        if lock(&self.inner.in_flight).is_some() {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.refresh(RefreshOptions::if_due("read")).await;
        });
    }

    pub async fn get_price(&self, id_or_name: &str) -> Option<PriceLookup> {
        self.refresh_in_background_if_due();

        let now = self.inner.clock.now_ms();
        let state = self.inner.state.read().await;
        let key = resolve_key(id_or_name, &state.prices, &state.aliases)?;
        let entry = state.prices.get(&key)?.clone();
        Some(PriceLookup {
            stale: state.is_stale(now, self.inner.config.stale_max),
            key,
            entry,
        })
    }

    pub async fn get_all_prices(&self) -> HashMap<String, PriceEntry> {
        self.refresh_in_background_if_due();
        self.inner.state.read().await.prices.clone()
    }

    pub async fn get_snapshot(&self) -> Snapshot {
        self.refresh_in_background_if_due();
        self.inner.state.read().await.to_snapshot()
    }

    pub async fn provider_health(&self) -> Vec<ProviderReport> {
        let now = self.inner.clock.now_ms();
        let state = self.inner.state.read().await;
        self.inner
            .sources
            .iter()
            .map(|source| {
                let health = state
                    .health
                    .get(source.name())
                    .cloned()
                    .unwrap_or_else(|| SourceHealth::new(source.weight()));
                ProviderReport {
                    name: source.name().to_string(),
                    enabled: source.enabled(),
                    in_cooldown: health.in_cooldown(now),
                    score: health.health_score(now, source.enabled()),
                    health,
                }
            })
            .collect()
    }

    /// Run a refresh cycle, or join the one already running
    pub async fn refresh(&self, options: RefreshOptions) -> RefreshOutcome {
        let pending = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.clone() {
                Some(pending) => {
                    debug!("Refresh already running; '{}' joins it", options.reason);
                    Some(pending)
                }
                None if !options.force && !self.is_due() => None,
                None => {
                    let pending = self.spawn_refresh(options.clone());
                    *slot = Some(pending.clone());
                    Some(pending)
                }
            }
        };

        match pending {
            Some(pending) => pending.await,
            None => {
                let state = self.inner.state.read().await;
                RefreshOutcome {
                    status: RefreshStatus::Skipped,
                    reason: options.reason,
                    started_at: self.inner.clock.now_ms(),
                    updated_at: state.updated_at,
                    price_count: state.prices.len(),
                    sources: Vec::new(),
                }
            }
        }
    }

    fn spawn_refresh(&self, options: RefreshOptions) -> PendingRefresh {
        let this = self.clone();
        let reason = options.reason.clone();
        let handle = tokio::spawn(async move {
            let _guard = InFlightGuard(this.inner.clone());
            this.run_refresh(options).await
        });

        let inner = self.inner.clone();
        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Refresh task ended abnormally: {}", e);
                    let state = inner.state.read().await;
                    RefreshOutcome {
                        status: RefreshStatus::Stale,
                        reason,
                        started_at: inner.clock.now_ms(),
                        updated_at: state.updated_at,
                        price_count: state.prices.len(),
                        sources: Vec::new(),
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run_refresh(&self, options: RefreshOptions) -> RefreshOutcome {
        let inner = &self.inner;
        // Never merge into (and then persist over) a snapshot not yet restored
        self.ensure_loaded().await;

        let started_at = inner.clock.now_ms();
        info!(
            "Refreshing prices (reason: {}{})",
            options.reason,
            if options.force { ", forced" } else { "" }
        );

        let (mut health, mut merged, previous_aliases, previous_updated_at) = {
            let state = inner.state.read().await;
            (
                state.health.clone(),
                state.prices.clone(),
                state.aliases.clone(),
                state.updated_at,
            )
        };

        let mut scratch: HashMap<String, PriceEntry> = HashMap::new();
        let mut fresh_aliases: Vec<(String, String)> = Vec::new();
        let mut outcomes = Vec::with_capacity(inner.sources.len());
        let mut enabled = 0usize;
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for source in &inner.sources {
            let name = source.name().to_string();
            let entry = health
                .entry(name.clone())
                .or_insert_with(|| SourceHealth::new(source.weight()));
            entry.weight = source.weight();

            if !source.enabled() {
                entry.mark_disabled();
                outcomes.push(SourceOutcome::new(&name, STATUS_DISABLED, 0, None));
                continue;
            }
            enabled += 1;

            let now = inner.clock.now_ms();
            if entry.in_cooldown(now) {
                debug!(
                    "Source '{}' cooling down for another {}s",
                    name,
                    (entry.next_retry_at - now) / 1000
                );
                outcomes.push(SourceOutcome::new(&name, STATUS_COOLDOWN, 0, entry.last_error.clone()));
                continue;
            }

            // Adapters bound each call with `fetch_timeout`; this only catches a hung scan
            let deadline = inner.config.source_deadline;
            let result = match tokio::time::timeout(deadline, source.fetch_prices()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::transient(format!(
                    "{} exceeded its {}ms deadline",
                    name,
                    deadline.as_millis()
                ))),
            };
            let finished = inner.clock.now_ms();

            match result {
                Ok(records) => {
                    let received = records.len();
                    let mut accepted = 0usize;
                    for raw in records {
                        let Some((key, candidate, aliases)) = normalize_record(raw, &name, started_at)
                        else {
                            continue;
                        };
                        accepted += 1;
                        fresh_aliases.extend(aliases.into_iter().map(|a| (a, key.clone())));
                        merge_candidate(&mut scratch, key, candidate, |s| {
                            inner.sources.iter().find(|src| src.name() == s).map_or(0, |src| src.weight())
                        });
                    }
                    if accepted < received {
                        debug!("Source '{}': discarded {} invalid records", name, received - accepted);
                    }
                    entry.record_success(finished, accepted);
                    succeeded += 1;
                    info!("Source '{}' returned {} prices", name, accepted);
                    outcomes.push(SourceOutcome::new(&name, STATUS_OK, accepted, None));
                }
                Err(err) => {
                    entry.record_failure(&err, finished, inner.config.refresh_interval);
                    failed += 1;
                    warn!(
                        "Source '{}' failed ({}): {}; retry in {}s",
                        name,
                        err.status(),
                        err,
                        entry.cooldown_ms / 1000
                    );
                    outcomes.push(SourceOutcome::new(&name, err.label(), 0, Some(err.to_string())));
                }
            }
        }

        let weight_of = |source_name: &str| {
            health.get(source_name).map_or(0, |h| h.weight)
        };
        for (key, candidate) in scratch {
            merge_candidate(&mut merged, key, candidate, weight_of);
        }

        let aliases = rebuild_aliases(&merged, &fresh_aliases, &previous_aliases);
        let updated_at = if succeeded > 0 {
            started_at
        } else {
            previous_updated_at
        };
        let price_count = merged.len();

        let snapshot = {
            let mut state = inner.state.write().await;
            state.prices = merged;
            state.aliases = aliases;
            state.health = health;
            state.updated_at = updated_at;
            state.last_attempt_at = started_at;
            state.to_snapshot()
        };

        if succeeded + failed > 0 {
            if let Err(e) = inner.store.save(&snapshot).await {
                error!(
                    "Failed to persist snapshot to {}: {}",
                    inner.store.path().display(),
                    e
                );
            }
        }

        let status = if succeeded == 0 {
            RefreshStatus::Stale
        } else if succeeded == enabled {
            RefreshStatus::Complete
        } else {
            RefreshStatus::Partial
        };
        info!(
            "Refresh {}: {} of {} enabled sources contributed, {} prices cached",
            status.as_str(),
            succeeded,
            enabled,
            price_count
        );

        self.schedule_next().await;

        RefreshOutcome {
            status,
            reason: options.reason,
            started_at,
            updated_at,
            price_count,
            sources: outcomes,
        }
    }

    /// Arm the timer for the soonest of the global interval and any cooldown expiry
    async fn schedule_next(&self) {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let interval_ms = inner.config.refresh_interval.as_millis() as i64;

        let next = {
            let state = inner.state.read().await;
            let base = state.updated_at.max(state.last_attempt_at) + interval_ms;
            state
                .health
                .values()
                .map(|h| h.next_retry_at)
                .filter(|at| *at > now)
                .fold(base, i64::min)
        };
        inner.next_refresh_at.store(next, Ordering::SeqCst);

        if inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let delay = Duration::from_millis((next - now).max(MIN_RESCHEDULE_MS) as u64);
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                PriceManager { inner }.on_timer().await;
            }
        });

        // `stop()` flips the flag before taking this lock, so re-checking under it
        // guarantees no timer survives shutdown
        let mut timer = lock(&inner.timer);
        if inner.stopped.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        if let Some(previous) = timer.replace(handle) {
            previous.abort();
        }
        debug!("Next refresh in {}s", delay.as_secs());
    }

    /// Boxed because the timer task it runs in is spawned by `schedule_next`
    fn on_timer(&self) -> BoxFuture<'static, ()> {
        let this = self.clone();
        async move {
            let outcome = this.refresh(RefreshOptions::if_due("scheduled")).await;
            // A completed run re-arms itself; a skipped one (clock moved back) must too
            if outcome.status == RefreshStatus::Skipped {
                this.schedule_next().await;
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sources::resale::{
        CatalogGift, MarketSession, ResaleListing, ResaleSource, SessionError, TypedAmount,
    };
    use crate::sources::MockPriceSource;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    const T0: i64 = 1_700_000_000_000;

    struct Harness {
        manager: PriceManager,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
        config: CacheConfig,
    }

    fn harness(sources: Vec<Arc<MockPriceSource>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            snapshot_path: dir.path().join("prices.json"),
            source_deadline: Duration::from_millis(500),
            ..CacheConfig::default()
        };
        let clock = Arc::new(ManualClock::new(T0));
        let sources: Vec<Arc<dyn PriceSource>> = sources
            .into_iter()
            .map(|s| s as Arc<dyn PriceSource>)
            .collect();
        let manager = PriceManager::with_clock(config.clone(), sources, clock.clone());
        Harness {
            manager,
            clock,
            _dir: dir,
            config,
        }
    }

    fn ton(price: Decimal, name: &str) -> RawPrice {
        RawPrice::new(price, Currency::Ton).with_name(name)
    }

    #[test]
    fn test_should_replace_rules() {
        assert!(should_replace(None, (1, 1)));
        assert!(should_replace(Some((50, 500)), (70, 100)));
        assert!(!should_replace(Some((70, 100)), (50, 500)));
        assert!(should_replace(Some((70, 100)), (70, 200)));
        assert!(!should_replace(Some((70, 200)), (70, 100)));
        assert!(!should_replace(Some((70, 100)), (70, 100)));
    }

    #[test]
    fn test_merge_is_order_independent_except_exact_ties() {
        let weights = |s: &str| if s == "high" { 70 } else { 50 };
        let low = PriceEntry {
            price: dec!(10),
            currency: Currency::Ton,
            source: "low".to_string(),
            ts: 900,
            name: None,
            gift_id: None,
        };
        let high = PriceEntry {
            price: dec!(12),
            source: "high".to_string(),
            ts: 100,
            ..low.clone()
        };

        for order in [[&low, &high], [&high, &low]] {
            let mut table = HashMap::new();
            for entry in order {
                merge_candidate(&mut table, "a".to_string(), entry.clone(), weights);
            }
            assert_eq!(table["a"].price, dec!(12));
        }

        let twin = PriceEntry {
            price: dec!(11),
            ..low.clone()
        };
        let mut table = HashMap::new();
        merge_candidate(&mut table, "a".to_string(), low.clone(), weights);
        merge_candidate(&mut table, "a".to_string(), twin, weights);
        assert_eq!(table["a"].price, dec!(10));
    }

    #[test]
    fn test_normalize_record_discards_invalid() {
        assert!(normalize_record(ton(dec!(0), "a"), "s", 1).is_none());
        assert!(normalize_record(ton(dec!(-2), "a"), "s", 1).is_none());

        let mut bad_currency = ton(dec!(2), "a");
        bad_currency.currency = "USD".to_string();
        assert!(normalize_record(bad_currency, "s", 1).is_none());

        let (key, entry, aliases) =
            normalize_record(ton(dec!(2), "Plush Pepe").with_gift_id(" 42 "), "s", 7).unwrap();
        assert_eq!(key, "gift:42");
        assert_eq!(entry.gift_id.as_deref(), Some("42"));
        assert_eq!(entry.ts, 7);
        assert!(aliases.contains(&"plush-pepe".to_string()));
    }

    #[tokio::test]
    async fn test_higher_weight_then_newer_timestamp_wins() {
        let a = Arc::new(MockPriceSource::new("fifty", 50).returning(Ok(vec![ton(dec!(10), "A")])));
        let b = Arc::new(
            MockPriceSource::new("seventy-old", 70).returning(Ok(vec![ton(dec!(12), "A").with_ts(100)])),
        );
        let c = Arc::new(
            MockPriceSource::new("seventy-new", 70).returning(Ok(vec![ton(dec!(9), "A").with_ts(200)])),
        );
        let h = harness(vec![a, b, c]);

        let outcome = h.manager.refresh(RefreshOptions::forced("test")).await;
        assert_eq!(outcome.status, RefreshStatus::Complete);

        let lookup = h.manager.get_price("A").await.unwrap();
        assert_eq!(lookup.entry.price, dec!(9));
        assert_eq!(lookup.entry.source, "seventy-new");
        assert!(!lookup.stale);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_run() {
        let source = Arc::new(
            MockPriceSource::new("slow", 50)
                .with_delay(Duration::from_millis(50))
                .returning(Ok(vec![ton(dec!(3), "A")])),
        );
        let h = harness(vec![source.clone()]);

        let (first, second) = tokio::join!(
            h.manager.refresh(RefreshOptions::if_due("one")),
            h.manager.refresh(RefreshOptions::if_due("two"))
        );

        assert_eq!(source.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(first.status, RefreshStatus::Complete);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_not_due_refresh_is_skipped() {
        let source = Arc::new(MockPriceSource::new("s", 50).returning(Ok(vec![ton(dec!(3), "A")])));
        let h = harness(vec![source.clone()]);

        h.manager.refresh(RefreshOptions::forced("first")).await;
        h.clock.advance_ms(1_000);
        let outcome = h.manager.refresh(RefreshOptions::if_due("again")).await;

        assert_eq!(outcome.status, RefreshStatus::Skipped);
        assert_eq!(source.calls(), 1);

        h.clock.advance_ms(h.config.refresh_interval.as_millis() as i64);
        let outcome = h.manager.refresh(RefreshOptions::if_due("due")).await;
        assert_eq!(outcome.status, RefreshStatus::Complete);
        assert_eq!(source.calls(), 2);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_rate_limited_source_is_skipped_during_cooldown() {
        let limited = Arc::new(MockPriceSource::new("limited", 70).returning(Err(
            SourceError::rate_limited(Some(Duration::from_secs(5)), "too many requests"),
        )));
        let healthy =
            Arc::new(MockPriceSource::new("healthy", 50).returning(Ok(vec![ton(dec!(4), "A")])));
        let h = harness(vec![limited.clone(), healthy.clone()]);

        let first = h.manager.refresh(RefreshOptions::forced("first")).await;
        assert_eq!(first.status, RefreshStatus::Partial);

        h.clock.advance_ms(2_000);
        let second = h.manager.refresh(RefreshOptions::forced("second")).await;

        assert_eq!(limited.calls(), 1);
        assert_eq!(healthy.calls(), 2);
        let limited_outcome = second.sources.iter().find(|s| s.name == "limited").unwrap();
        assert_eq!(limited_outcome.status, "cooldown");

        let report = h.manager.provider_health().await;
        let limited_report = report.iter().find(|r| r.name == "limited").unwrap();
        assert!(limited_report.in_cooldown);
        assert_eq!(limited_report.health.next_retry_at, T0 + 5_000);

        h.clock.advance_ms(3_000);
        h.manager.refresh(RefreshOptions::forced("third")).await;
        assert_eq!(limited.calls(), 2);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_prices_and_staleness_honest() {
        let source = Arc::new(
            MockPriceSource::new("flaky", 50)
                .then(Ok(vec![ton(dec!(5), "A")]))
                .returning(Err(SourceError::server(502, "bad gateway"))),
        );
        let h = harness(vec![source]);

        let first = h.manager.refresh(RefreshOptions::forced("first")).await;
        assert_eq!(first.updated_at, T0);

        h.clock.advance_ms(60_000);
        let second = h.manager.refresh(RefreshOptions::forced("second")).await;
        assert_eq!(second.status, RefreshStatus::Stale);
        assert_eq!(second.updated_at, T0);
        assert_eq!(second.sources[0].status, "server_error");

        let lookup = h.manager.get_price("a").await.unwrap();
        assert_eq!(lookup.entry.price, dec!(5));
        assert_eq!(h.manager.get_snapshot().await.updated_at, T0);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_staleness() {
        let source = Arc::new(MockPriceSource::new("s", 50).returning(Ok(vec![ton(dec!(1), "A")])));
        let h = harness(vec![source]);
        h.manager.stop();

        assert!(h.manager.is_stale().await);
        h.manager.refresh(RefreshOptions::forced("test")).await;
        assert!(!h.manager.is_stale().await);

        let stale_ms = h.config.stale_max.as_millis() as i64;
        h.clock.advance_ms(stale_ms);
        assert!(!h.manager.is_stale().await);
        h.clock.advance_ms(1);
        assert!(h.manager.is_stale().await);
        assert!(h.manager.get_price("A").await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_timeout_is_isolated_to_source() {
        let hung = Arc::new(
            MockPriceSource::new("hung", 90)
                .with_delay(Duration::from_secs(5))
                .returning(Ok(vec![ton(dec!(1), "A")])),
        );
        let quick = Arc::new(MockPriceSource::new("quick", 50).returning(Ok(vec![ton(dec!(2), "A")])));
        let h = harness(vec![hung, quick]);

        let outcome = h.manager.refresh(RefreshOptions::forced("test")).await;
        assert_eq!(outcome.status, RefreshStatus::Partial);
        assert_eq!(outcome.sources[0].status, "transient");
        assert_eq!(h.manager.get_price("A").await.unwrap().entry.price, dec!(2));
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_disabled_source_is_never_called() {
        let off = Arc::new(MockPriceSource::new("off", 90).disabled());
        let on = Arc::new(MockPriceSource::new("on", 50).returning(Ok(vec![ton(dec!(2), "A")])));
        let h = harness(vec![off.clone(), on]);

        let outcome = h.manager.refresh(RefreshOptions::forced("test")).await;
        assert_eq!(off.calls(), 0);
        assert_eq!(outcome.sources[0].status, "disabled");
        assert_eq!(outcome.status, RefreshStatus::Complete);

        let report = h.manager.provider_health().await;
        assert_eq!(report[0].score, 70);
        assert_eq!(report[1].score, 100);
        h.manager.stop();
    }

    #[tokio::test]
    async fn test_snapshot_restores_prices_aliases_and_backoff() {
        let good = Arc::new(MockPriceSource::new("good", 70).returning(Ok(vec![
            ton(dec!(7), "Plush Pepe").with_gift_id("42").with_alias("pepe"),
        ])));
        let bad = Arc::new(MockPriceSource::new("bad", 50).returning(Err(SourceError::auth("revoked"))));
        let h = harness(vec![good, bad]);

        h.manager.init().await;
        h.manager.refresh(RefreshOptions::forced("first")).await;
        h.manager.stop();
        let before = h.manager.get_snapshot().await;

        let bad_again = Arc::new(MockPriceSource::new("bad", 50).returning(Err(SourceError::auth("revoked"))));
        let restarted = PriceManager::with_clock(
            h.config.clone(),
            vec![bad_again.clone() as Arc<dyn PriceSource>],
            h.clock.clone(),
        );
        restarted.init().await;
        restarted.init().await;

        let after = restarted.get_snapshot().await;
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.prices, before.prices);
        assert_eq!(after.aliases, before.aliases);
        assert_eq!(after.provider_stats["bad"], before.provider_stats["bad"]);
        assert_eq!(restarted.get_price("pepe").await.unwrap().key, "gift:42");

        h.clock.advance_ms(60_000);
        restarted.refresh(RefreshOptions::forced("after restart")).await;
        assert_eq!(bad_again.calls(), 0);
        restarted.stop();
    }

    #[tokio::test]
    async fn test_init_without_snapshot_starts_empty() {
        let h = harness(vec![Arc::new(MockPriceSource::new("s", 50))]);
        h.manager.init().await;
        h.manager.stop();

        assert!(h.manager.get_all_prices().await.is_empty());
        assert!(h.manager.get_price("anything").await.is_none());
        assert!(h.manager.is_stale().await);
    }

    /// Catalog of `gifts` items, each answering its listing query after a short pause
    struct LargeCatalog {
        gifts: usize,
        per_call: Duration,
    }

    #[async_trait]
    impl MarketSession for LargeCatalog {
        async fn fetch_catalog(&self) -> Result<Vec<CatalogGift>, SessionError> {
            Ok((1..=self.gifts)
                .map(|i| CatalogGift {
                    id: i.to_string(),
                    title: format!("Gift {}", i),
                })
                .collect())
        }

        async fn fetch_resale_listings(
            &self,
            gift_id: &str,
            _limit: usize,
        ) -> Result<Vec<ResaleListing>, SessionError> {
            tokio::time::sleep(self.per_call).await;
            let nanotons = gift_id.parse::<i64>().unwrap_or(1) * 1_000_000_000;
            Ok(vec![ResaleListing {
                amount: TypedAmount::Ton { nanotons },
            }])
        }
    }

    #[tokio::test]
    async fn test_long_resale_scan_is_not_cut_by_call_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            snapshot_path: dir.path().join("prices.json"),
            fetch_timeout: Duration::from_millis(50),
            ..CacheConfig::default()
        };
        let session = Arc::new(LargeCatalog {
            gifts: 40,
            per_call: Duration::from_millis(5),
        });
        let resale = ResaleSource::new(&config.resale, Some(session), config.fetch_timeout)
            .with_pacing(1, 3);
        let manager = PriceManager::with_clock(
            config,
            vec![Arc::new(resale) as Arc<dyn PriceSource>],
            Arc::new(ManualClock::new(T0)),
        );

        // The scan as a whole takes several times `fetch_timeout`
        let outcome = manager.refresh(RefreshOptions::forced("test")).await;
        assert_eq!(outcome.status, RefreshStatus::Complete);
        assert_eq!(outcome.sources[0].count, 40);
        assert_eq!(outcome.price_count, 40);
        assert_eq!(manager.get_price("40").await.unwrap().entry.price, dec!(40));
        manager.stop();
    }

    #[tokio::test]
    async fn test_refresh_before_init_keeps_persisted_snapshot() {
        let failing = Arc::new(
            MockPriceSource::new("down", 50).returning(Err(SourceError::server(503, "unavailable"))),
        );
        let h = harness(vec![failing.clone()]);

        let store = SnapshotStore::new(h.config.snapshot_path.clone());
        let mut prices = HashMap::new();
        prices.insert(
            "gift:1".to_string(),
            PriceEntry {
                price: dec!(5),
                currency: Currency::Ton,
                source: "down".to_string(),
                ts: T0 - 1_000,
                name: Some("Plush Pepe".to_string()),
                gift_id: Some("1".to_string()),
            },
        );
        store
            .save(&Snapshot {
                updated_at: T0 - 1_000,
                prices,
                ..Snapshot::default()
            })
            .await
            .unwrap();

        let outcome = h.manager.refresh(RefreshOptions::if_due("read")).await;
        assert_eq!(failing.calls(), 1);
        assert_eq!(outcome.status, RefreshStatus::Stale);
        assert_eq!(outcome.price_count, 1);

        h.manager.init().await;
        h.manager.stop();
        assert_eq!(h.manager.get_price("1").await.unwrap().entry.price, dec!(5));

        let on_disk = store.load().await.unwrap().unwrap();
        assert_eq!(on_disk.updated_at, T0 - 1_000);
        assert_eq!(on_disk.prices.len(), 1);
        assert_eq!(on_disk.provider_stats["down"].fail_count, 1);
    }

    #[tokio::test]
    async fn test_skipped_timer_run_rearms_timer() {
        let source = Arc::new(MockPriceSource::new("s", 50).returning(Ok(vec![ton(dec!(1), "A")])));
        let h = harness(vec![source.clone()]);
        h.manager.refresh(RefreshOptions::forced("first")).await;

        if let Some(timer) = lock(&h.manager.inner.timer).take() {
            timer.abort();
        }
        h.manager.on_timer().await;

        assert_eq!(source.calls(), 1);
        assert!(lock(&h.manager.inner.timer).is_some());
        h.manager.stop();
        assert!(lock(&h.manager.inner.timer).is_none());
    }

    #[tokio::test]
    async fn test_stop_during_refresh_leaves_no_timer() {
        let source = Arc::new(
            MockPriceSource::new("slow", 50)
                .with_delay(Duration::from_millis(100))
                .returning(Ok(vec![ton(dec!(1), "A")])),
        );
        let h = harness(vec![source]);

        let manager = h.manager.clone();
        let running =
            tokio::spawn(async move { manager.refresh(RefreshOptions::forced("test")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.manager.stop();

        let outcome = running.await.unwrap();
        assert_eq!(outcome.status, RefreshStatus::Complete);
        assert!(lock(&h.manager.inner.timer).is_none());
    }

    #[tokio::test]
    async fn test_read_triggers_background_refresh_when_due() {
        let source = Arc::new(MockPriceSource::new("s", 50).returning(Ok(vec![ton(dec!(1), "A")])));
        let h = harness(vec![source.clone()]);

        assert!(h.manager.get_price("A").await.is_none());
        for _ in 0..50 {
            if source.calls() > 0 && h.manager.get_price("A").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(source.calls(), 1);
        assert_eq!(h.manager.get_price("A").await.unwrap().entry.price, dec!(1));
        h.manager.stop();
    }
}
