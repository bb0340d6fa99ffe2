use super::IndicatorBundle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Cache handle shared between the orchestrator and indicator fetchers
pub type SharedIndicatorCache = Arc<Mutex<IndicatorCache>>;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: IndicatorBundle,
    stored_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub active_entries: usize,
    pub expired_entries: usize,
    pub ttl: Duration,
}

/// Time-boxed store of indicator bundles keyed by (asset, interval)
///
/// Expired entries are evicted lazily when read. Not synchronized; share it through
/// [`SharedIndicatorCache`].
#[derive(Debug)]
pub struct IndicatorCache {
    ttl: Duration,
    entries: HashMap<(String, String), CacheEntry>,
}

impl IndicatorCache {
    pub fn new(ttl: Duration) -> Self {
        tracing::info!("Indicator cache initialized (ttl {}s)", ttl.as_secs());
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn shared(ttl: Duration) -> SharedIndicatorCache {
        Arc::new(Mutex::new(Self::new(ttl)))
    }

    pub fn get(&mut self, asset: &str, interval: &str) -> Option<IndicatorBundle> {
        let key = (asset.to_string(), interval.to_string());
        let entry = self.entries.get(&key)?;
        let age = entry.stored_at.elapsed();

        if age > self.ttl {
            tracing::debug!(asset, interval, age_secs = age.as_secs_f64(), "Cache entry expired");
            self.entries.remove(&key);
            return None;
        }

        tracing::debug!(asset, interval, age_secs = age.as_secs_f64(), "Cache hit");
        Some(entry.data.clone())
    }

    pub fn set(&mut self, asset: &str, interval: &str, data: IndicatorBundle) {
        self.entries.insert(
            (asset.to_string(), interval.to_string()),
            CacheEntry {
                data,
                stored_at: Instant::now(),
            },
        );
        tracing::debug!(asset, interval, "Cache write");
    }

    pub fn clear(&mut self) {
        let count = self.entries.len();
        self.entries.clear();
        tracing::info!("Cleared indicator cache ({} entries)", count);
    }

    /// Counts computed on demand; expired entries are not evicted here.
    pub fn stats(&self) -> CacheStats {
        let active_entries = self
            .entries
            .values()
            .filter(|entry| entry.stored_at.elapsed() <= self.ttl)
            .count();

        CacheStats {
            total_entries: self.entries.len(),
            active_entries,
            expired_entries: self.entries.len() - active_entries,
            ttl: self.ttl,
        }
    }
}

impl Default for IndicatorCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
