use crate::catalog::types::ColumnTypes;
use crate::error::GateError;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub connection: String,
    pub table: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchemaCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-local column-type cache keyed by (connection, table).
///
/// There is no cross-process invalidation: a schema change made elsewhere is
/// only observed after [`SchemaCache::invalidate`] or
/// [`SchemaCache::invalidate_all`].
pub struct SchemaCache {
    entries: Mutex<LruCache<SchemaKey, Arc<ColumnTypes>>>,
    enabled: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SchemaCache {
    pub fn new(capacity: usize, enabled: bool) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            enabled: AtomicBool::new(enabled),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Disabling also drops every cached entry.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if !enabled {
            self.entries.lock().clear();
        }
    }

    pub fn get(&self, connection: &str, table: &str) -> Option<Arc<ColumnTypes>> {
        if !self.is_enabled() {
            return None;
        }
        let key = SchemaKey {
            connection: connection.to_string(),
            table: table.to_string(),
        };
        self.entries.lock().get(&key).cloned()
    }

    pub async fn get_or_load<F, Fut>(
        &self,
        connection: &str,
        table: &str,
        load: F,
    ) -> Result<Arc<ColumnTypes>, GateError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ColumnTypes, GateError>>,
    {
        if let Some(cached) = self.get(connection, table) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(connection, table, "loading column types");
        let loaded = Arc::new(load().await?);
        if self.is_enabled() {
            let key = SchemaKey {
                connection: connection.to_string(),
                table: table.to_string(),
            };
            self.entries.lock().put(key, loaded.clone());
        }
        Ok(loaded)
    }

    /// Drops the cached schema of one table on every connection.
    pub fn invalidate(&self, table: &str) {
        let mut entries = self.entries.lock();
        let stale: Vec<SchemaKey> = entries
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        info!(table, dropped = stale.len(), "schema cache invalidated");
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        info!(dropped, "schema cache cleared");
    }

    pub fn stats(&self) -> SchemaCacheStats {
        SchemaCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SchemaCache;
    use crate::catalog::types::{ColumnType, ColumnTypes};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn products() -> ColumnTypes {
        ColumnTypes::new()
            .with("id", ColumnType::Integer)
            .with("price", ColumnType::Json)
    }

    #[tokio::test]
    async fn loads_once_until_invalidated() {
        let cache = SchemaCache::new(8, true);
        let loads = AtomicUsize::new(0);
        for _ in 0..3 {
            let types = cache
                .get_or_load("default", "products", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(products())
                })
                .await
                .expect("load");
            assert!(types.is_json("price"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate("products");
        cache
            .get_or_load("default", "products", || async {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(products())
            })
            .await
            .expect("reload");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().hits, 2);
    }

    #[tokio::test]
    async fn disabled_cache_always_loads() {
        let cache = SchemaCache::new(8, false);
        let loads = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_load("default", "products", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(products())
                })
                .await
                .expect("load");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().entries, 0);
    }

    #[tokio::test]
    async fn invalidate_all_drops_every_connection() {
        let cache = SchemaCache::new(8, true);
        for conn in ["primary", "replica"] {
            cache
                .get_or_load(conn, "products", || async { Ok(products()) })
                .await
                .expect("load");
        }
        assert_eq!(cache.stats().entries, 2);
        cache.invalidate_all();
        assert!(cache.get("primary", "products").is_none());
        assert_eq!(cache.stats().entries, 0);
    }
}
