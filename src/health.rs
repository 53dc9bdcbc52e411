//! health.rs - Per-source failure tracking and backoff
//!
//! A source moves through `ok` and the classified failure labels. Each failure
//! pushes `next_retry_at` into the future; the refresh loop skips the source
//! until that instant has passed.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SourceError;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;

pub const RATE_LIMIT_TIERS_MS: [i64; 4] = [MINUTE_MS, 5 * MINUTE_MS, 15 * MINUTE_MS, HOUR_MS];
pub const SERVER_ERROR_TIERS_MS: [i64; 4] = [5 * MINUTE_MS, 15 * MINUTE_MS, HOUR_MS, 6 * HOUR_MS];
pub const TRANSIENT_TIERS_MS: [i64; 3] = [MINUTE_MS, 5 * MINUTE_MS, 15 * MINUTE_MS];

pub const AUTH_MIN_COOLDOWN_MS: i64 = HOUR_MS;
pub const FORBIDDEN_COOLDOWN_MS: i64 = 6 * HOUR_MS;
pub const CONFIG_COOLDOWN_MS: i64 = 24 * HOUR_MS;

pub const STATUS_OK: &str = "ok";
pub const STATUS_DISABLED: &str = "disabled";
pub const STATUS_COOLDOWN: &str = "cooldown";
pub const STATUS_UNKNOWN: &str = "unknown";

/// Pick the tier for the n-th consecutive failure, plateauing at the last one
fn tier(tiers: &[i64], fail_count: u32) -> i64 {
    let index = (fail_count.max(1) - 1) as usize;
    tiers[index.min(tiers.len() - 1)]
}

/// Backoff and status counters for one price source
///
/// Timestamps are ms since epoch, `0` meaning never.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceHealth {
    pub weight: u32,
    pub fail_count: u32,
    pub last_fail_at: i64,
    pub last_success_at: i64,
    pub next_retry_at: i64,
    pub cooldown_ms: i64,
    pub last_error: Option<String>,
    pub last_status: String,
    pub last_result_count: usize,
}

impl Default for SourceHealth {
    fn default() -> Self {
        SourceHealth {
            weight: 0,
            fail_count: 0,
            last_fail_at: 0,
            last_success_at: 0,
            next_retry_at: 0,
            cooldown_ms: 0,
            last_error: None,
            last_status: STATUS_UNKNOWN.to_string(),
            last_result_count: 0,
        }
    }
}

impl SourceHealth {
    pub fn new(weight: u32) -> Self {
        SourceHealth {
            weight,
            ..SourceHealth::default()
        }
    }

    pub fn in_cooldown(&self, now: i64) -> bool {
        now < self.next_retry_at
    }

    pub fn record_success(&mut self, now: i64, result_count: usize) {
        self.fail_count = 0;
        self.last_success_at = now;
        self.next_retry_at = 0;
        self.cooldown_ms = 0;
        self.last_error = None;
        self.last_status = STATUS_OK.to_string();
        self.last_result_count = result_count;
    }

    /// Apply a classified failure and compute the next retry instant
    pub fn record_failure(&mut self, err: &SourceError, now: i64, refresh_interval: Duration) {
        self.fail_count = self.fail_count.saturating_add(1);
        self.last_fail_at = now;
        self.last_error = Some(err.to_string());
        self.last_status = err.label().to_string();
        self.last_result_count = 0;

        let cooldown = match err {
            SourceError::Configuration(_) => CONFIG_COOLDOWN_MS,
            SourceError::Auth { .. } => {
                (refresh_interval.as_millis() as i64).max(AUTH_MIN_COOLDOWN_MS)
            }
            SourceError::Forbidden(_) => FORBIDDEN_COOLDOWN_MS,
            SourceError::RateLimited {
                retry_after: Some(delay),
                ..
            } if !delay.is_zero() => delay.as_millis() as i64,
            SourceError::RateLimited { .. } => tier(&RATE_LIMIT_TIERS_MS, self.fail_count),
            SourceError::Server { .. } => tier(&SERVER_ERROR_TIERS_MS, self.fail_count),
            SourceError::Transient(_) => tier(&TRANSIENT_TIERS_MS, self.fail_count),
        };

        self.cooldown_ms = cooldown;
        self.next_retry_at = now.saturating_add(cooldown);
    }

    pub fn mark_disabled(&mut self) {
        self.last_status = STATUS_DISABLED.to_string();
    }

    /// Observability score in 0..=100; not used for merge decisions
    pub fn health_score(&self, now: i64, enabled: bool) -> u8 {
        let mut score: i64 = 100;
        score -= 15 * i64::from(self.fail_count.min(5));
        if self.in_cooldown(now) {
            score -= 20;
        }
        if self.last_success_at == 0 {
            score -= 10;
        }
        if !enabled {
            score -= 20;
        }
        score.clamp(0, 100) as u8
    }
}
