//! main.rs - Diagnostic entry point for the gift price cache
//!
//! Loads the manager from the environment, prints the cached snapshot,
//! forces one refresh and prints the most recently updated prices.

use gift_price_cache::{build_sources, CacheConfig, PriceManager, RefreshOptions, NAME, VERSION};
use log::{info, warn};

/// Number of recent prices to display after the refresh
const RECENT_PRICES_SHOWN: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    println!();
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║     Gift Price Cache diagnostics v{:<23}║", VERSION);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();

    info!("Starting {} v{}", NAME, VERSION);

    let config = CacheConfig::from_env()?;
    info!("Snapshot file: {}", config.snapshot_path.display());

    // No messaging-platform session is available outside the host service
    let sources = build_sources(&config, None);
    let manager = PriceManager::new(config, sources);
    manager.init().await;

    let snapshot = manager.get_snapshot().await;
    info!(
        "Cached snapshot: {} prices, {} aliases, updated at {}",
        snapshot.prices.len(),
        snapshot.aliases.len(),
        format_ts(snapshot.updated_at)
    );
    for report in manager.provider_health().await {
        info!(
            "  - {:<10} enabled={:<5} score={:>3} status={} failures={}",
            report.name,
            report.enabled,
            report.score,
            report.health.last_status,
            report.health.fail_count
        );
    }

    info!("Forcing refresh...");
    let outcome = manager.refresh(RefreshOptions::forced("diagnostic")).await;
    info!(
        "Refresh {}: {} prices, updated at {}",
        outcome.status.as_str(),
        outcome.price_count,
        format_ts(outcome.updated_at)
    );
    for source in &outcome.sources {
        match &source.error {
            Some(error) => warn!("  - {}: {} ({})", source.name, source.status, error),
            None => info!("  - {}: {} ({} prices)", source.name, source.status, source.count),
        }
    }

    let mut prices: Vec<_> = manager.get_all_prices().await.into_iter().collect();
    prices.sort_by(|a, b| b.1.ts.cmp(&a.1.ts));

    println!();
    println!("┌──────────────────────────────┬────────────────┬──────────────┬─────────────────────────┐");
    println!("│ Key                          │ Price          │ Source       │ Updated                 │");
    println!("├──────────────────────────────┼────────────────┼──────────────┼─────────────────────────┤");
    for (key, entry) in prices.iter().take(RECENT_PRICES_SHOWN) {
        println!(
            "│ {:28} │ {:>8} {:<5} │ {:12} │ {:23} │",
            truncate(key, 28),
            entry.price.to_string(),
            entry.currency.as_str(),
            entry.source,
            format_ts(entry.ts)
        );
    }
    println!("└──────────────────────────────┴────────────────┴──────────────┴─────────────────────────┘");
    println!();

    if manager.is_stale().await {
        warn!("Cache is stale");
    }

    manager.stop();
    Ok(())
}

fn format_ts(ms: i64) -> String {
    if ms <= 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}
