//! TTL cache of provider payloads keyed by location and data kind.
//!
//! Entries are never evicted on expiry: a stale entry stays until it is
//! overwritten, so it can still serve as a last-known fallback. Freshness is
//! measured with `tokio::time::Instant`.
//!
//! The cache can be snapshotted to `weather_cache.json` in the config
//! directory and restored on the next start.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::WeatherError;
use crate::location::LocationKey;
use crate::types::{CacheKey, DataKind, ProviderId, WeatherPayload};

/// Default time-to-live (5 minutes)
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Cache file name inside the config directory
pub const CACHE_FILE_NAME: &str = "weather_cache.json";

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: WeatherPayload,
    pub provider: ProviderId,
    pub inserted_at: Instant,
    /// Wall-clock time of the fetch, for display and persistence
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }

    /// Fresh iff `now - inserted_at < ttl`.
    pub fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

#[derive(Debug, Default)]
pub struct RequestCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key`, fresh or stale.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    pub fn get_if_fresh(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.get(key).filter(CacheEntry::is_fresh)
    }

    /// Insert or overwrite the entry for `key`.
    pub fn put(
        &self,
        key: CacheKey,
        payload: WeatherPayload,
        provider: ProviderId,
        ttl: Duration,
    ) -> CacheEntry {
        let entry = CacheEntry {
            payload,
            provider,
            inserted_at: Instant::now(),
            fetched_at: Utc::now(),
            ttl,
        };
        self.entries.lock().insert(key, entry.clone());
        tracing::debug!("Cached {} from {} (ttl {:?})", key, provider, ttl);
        entry
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop every kind cached for `location`. Returns how many were removed.
    pub fn invalidate_location(&self, location: LocationKey) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| key.location != location);
        before - entries.len()
    }

    /// Write all entries to `path` as JSON.
    pub fn save_to(&self, path: &Path) -> Result<usize, WeatherError> {
        let entries: Vec<SnapshotEntry> = self
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| SnapshotEntry {
                location: key.location,
                kind: key.kind,
                provider: entry.provider,
                fetched_at: entry.fetched_at,
                ttl_secs: entry.ttl.as_secs(),
                payload: entry.payload.clone(),
            })
            .collect();
        let count = entries.len();

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| WeatherError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| WeatherError::Persistence(e.to_string()))?;
        }
        // Write then rename so a crash never leaves a truncated file
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| WeatherError::Persistence(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| WeatherError::Persistence(e.to_string()))?;

        tracing::debug!("Saved {} cache entries to {}", count, path.display());
        Ok(count)
    }

    /// Restore entries written by [`save_to`](Self::save_to).
    ///
    /// A missing or unreadable file restores nothing. Individual unreadable
    /// entries are skipped. Restored entries keep their age, so they are
    /// fresh only if still within their TTL.
    pub fn load_from(&self, path: &Path) -> Result<usize, WeatherError> {
        if !path.exists() {
            return Ok(0);
        }

        let contents =
            fs::read_to_string(path).map_err(|e| WeatherError::Persistence(e.to_string()))?;
        let snapshot: RawSnapshot = match serde_json::from_str(&contents) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let err = WeatherError::CacheCorruption(e.to_string());
                tracing::warn!("Ignoring weather cache {}: {}", path.display(), err);
                return Ok(0);
            }
        };
        if snapshot.version != SNAPSHOT_VERSION {
            tracing::info!(
                "Ignoring weather cache with version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
            return Ok(0);
        }

        let now = Instant::now();
        let wall_now = Utc::now();
        let mut restored = 0;
        let mut entries = self.entries.lock();

        for raw in snapshot.entries {
            let entry = match decode_entry(raw) {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!("Skipping cache entry: {}", err);
                    continue;
                }
            };

            let age = (wall_now - entry.fetched_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            let ttl = Duration::from_secs(entry.ttl_secs);
            // Older than the monotonic clock can express: keep it, but stale
            let (inserted_at, ttl) = match now.checked_sub(age) {
                Some(at) => (at, ttl),
                None => (now, Duration::ZERO),
            };

            entries.insert(
                CacheKey::new(entry.location, entry.kind),
                CacheEntry {
                    payload: entry.payload,
                    provider: entry.provider,
                    inserted_at,
                    fetched_at: entry.fetched_at,
                    ttl,
                },
            );
            restored += 1;
        }

        tracing::info!("Restored {} cached weather entries", restored);
        Ok(restored)
    }
}

#[derive(Debug, Serialize)]
struct Snapshot {
    version: u32,
    entries: Vec<SnapshotEntry>,
}

/// Entries are decoded one at a time so a bad one does not sink the rest.
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    version: u32,
    #[serde(default)]
    entries: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    location: LocationKey,
    kind: DataKind,
    provider: ProviderId,
    fetched_at: DateTime<Utc>,
    ttl_secs: u64,
    payload: WeatherPayload,
}

fn decode_entry(raw: serde_json::Value) -> Result<SnapshotEntry, WeatherError> {
    let entry: SnapshotEntry =
        serde_json::from_value(raw).map_err(|e| WeatherError::CacheCorruption(e.to_string()))?;
    if entry.payload.kind() != entry.kind {
        return Err(WeatherError::CacheCorruption(format!(
            "{} entry holds a {} payload",
            entry.kind,
            entry.payload.kind()
        )));
    }
    Ok(entry)
}
