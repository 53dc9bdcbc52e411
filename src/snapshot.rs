//! snapshot.rs - File persistence for prices, aliases and provider health

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::SnapshotError;
use crate::health::SourceHealth;
use crate::keys::rebuild_aliases;
use crate::models::PriceEntry;

/// Full persisted cache state
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Time of the last successful merge, ms since epoch; `0` if never
    pub updated_at: i64,
    pub prices: HashMap<String, PriceEntry>,
    pub aliases: HashMap<String, String>,
    pub provider_stats: HashMap<String, SourceHealth>,
}

/// Loosely typed view of the file, validated entry by entry
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawSnapshot {
    updated_at: Option<i64>,
    prices: HashMap<String, Value>,
    aliases: HashMap<String, Value>,
    provider_stats: HashMap<String, Value>,
}

impl RawSnapshot {
    fn validate(self) -> Snapshot {
        let mut dropped = 0usize;

        let prices: HashMap<String, PriceEntry> = self
            .prices
            .into_iter()
            .filter_map(|(key, value)| {
                if key.trim().is_empty() {
                    dropped += 1;
                    return None;
                }
                match serde_json::from_value::<PriceEntry>(value) {
                    Ok(entry) if entry.is_valid() => Some((key, entry)),
                    _ => {
                        dropped += 1;
                        None
                    }
                }
            })
            .collect();

        if dropped > 0 {
            warn!("Dropped {} invalid price entries from snapshot", dropped);
        }

        let previous_aliases: HashMap<String, String> = self
            .aliases
            .into_iter()
            .filter_map(|(alias, target)| match target {
                Value::String(key) => Some((alias, key)),
                _ => None,
            })
            .collect();
        let aliases = rebuild_aliases(&prices, &[], &previous_aliases);

        let provider_stats = self
            .provider_stats
            .into_iter()
            .filter_map(|(name, value)| match serde_json::from_value::<SourceHealth>(value) {
                Ok(health) => Some((name, health)),
                Err(e) => {
                    warn!("Ignoring unreadable provider stats for '{}': {}", name, e);
                    None
                }
            })
            .collect();

        Snapshot {
            updated_at: self.updated_at.unwrap_or(0).max(0),
            prices,
            aliases,
            provider_stats,
        }
    }
}

/// Reads and atomically replaces the snapshot file
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnapshotStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    /// Load the last snapshot; `Ok(None)` when no file exists yet
    pub async fn load(&self) -> Result<Option<Snapshot>, SnapshotError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let raw: RawSnapshot = serde_json::from_str(&content)?;
        let snapshot = raw.validate();
        info!(
            "Loaded snapshot from {}: {} prices, {} aliases, {} providers",
            self.path.display(),
            snapshot.prices.len(),
            snapshot.aliases.len(),
            snapshot.provider_stats.len()
        );
        Ok(Some(snapshot))
    }

    /// Write to a temporary sibling file, then rename it over the real path
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        if let Err(e) = tokio::fs::write(&temp, &content).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }

        debug!(
            "Saved snapshot with {} prices to {}",
            snapshot.prices.len(),
            self.path.display()
        );
        Ok(())
    }
}
