use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::object_path::{join, leaf_name};
use crate::transport::{Transport, TransportError};

pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SCHEMA_OBJECTS: usize = 50;

/// Schema snapshot of one database on one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCacheEntry {
    pub database: String,
    pub objects: Vec<String>,
    pub fields: BTreeMap<String, Vec<String>>,
    pub tags: BTreeMap<String, Vec<String>>,
    pub refreshed_at: Instant,
}

impl SchemaCacheEntry {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.refreshed_at) < ttl
    }

    /// Key under which `object` was cached, accepting bare, qualified or
    /// leaf-only names.
    fn object_key(&self, object: &str) -> Option<&str> {
        let qualified = join(&self.database, object);
        self.objects
            .iter()
            .find(|candidate| *candidate == object || **candidate == qualified)
            .or_else(|| {
                self.objects
                    .iter()
                    .find(|candidate| leaf_name(candidate) == leaf_name(object))
            })
            .map(String::as_str)
    }

    #[must_use]
    pub fn fields_of(&self, object: &str) -> &[String] {
        self.object_key(object)
            .and_then(|key| self.fields.get(key))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn tags_of(&self, object: &str) -> &[String] {
        self.object_key(object)
            .and_then(|key| self.tags.get(key))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Every cached field name, sorted and deduplicated.
    #[must_use]
    pub fn all_fields(&self) -> Vec<&str> {
        let mut fields = self
            .fields
            .values()
            .flatten()
            .map(String::as_str)
            .collect::<Vec<_>>();
        fields.sort_unstable();
        fields.dedup();
        fields
    }
}

#[derive(Debug, Error)]
pub enum SchemaCacheError {
    #[error("listing objects of `{database}` failed: {source}")]
    Transport {
        database: String,
        #[source]
        source: TransportError,
    },
}

type CacheKey = (String, String);

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, Arc<SchemaCacheEntry>>,
    refreshing: HashSet<CacheKey>,
}

/// Clears the in-flight marker for a key when a refresh ends, including when
/// the refreshing future is dropped.
struct RefreshGuard<'a> {
    cache: &'a SchemaCache,
    key: CacheKey,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.cache.state().refreshing.remove(&self.key);
    }
}

/// TTL cache of object, field and tag names keyed by connection and database.
pub struct SchemaCache {
    transport: Arc<dyn Transport>,
    ttl: Duration,
    max_objects: usize,
    state: Mutex<CacheState>,
}

impl fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaCache")
            .field("ttl", &self.ttl)
            .field("max_objects", &self.max_objects)
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}

impl SchemaCache {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, ttl: Duration) -> Self {
        Self {
            transport,
            ttl,
            max_objects: DEFAULT_MAX_SCHEMA_OBJECTS,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached entry regardless of age, without touching the transport.
    #[must_use]
    pub fn peek(&self, connection_id: &str, database: &str) -> Option<Arc<SchemaCacheEntry>> {
        self.state()
            .entries
            .get(&(connection_id.to_string(), database.to_string()))
            .cloned()
    }

    /// Fresh entry for `connection_id`/`database`, refreshing it when absent
    /// or expired.
    ///
    /// When another refresh of the same key is in flight this returns
    /// whatever is cached right now, possibly nothing.
    pub async fn get(
        &self,
        connection_id: &str,
        database: &str,
    ) -> Result<Option<Arc<SchemaCacheEntry>>, SchemaCacheError> {
        self.get_at(connection_id, database, Instant::now()).await
    }

    pub async fn refresh(
        &self,
        connection_id: &str,
        database: &str,
    ) -> Result<Option<Arc<SchemaCacheEntry>>, SchemaCacheError> {
        self.refresh_at(connection_id, database, Instant::now()).await
    }

    pub fn invalidate(&self, connection_id: &str, database: &str) {
        self.state()
            .entries
            .remove(&(connection_id.to_string(), database.to_string()));
    }

    pub fn clear(&self) {
        self.state().entries.clear();
    }

    async fn get_at(
        &self,
        connection_id: &str,
        database: &str,
        now: Instant,
    ) -> Result<Option<Arc<SchemaCacheEntry>>, SchemaCacheError> {
        if let Some(entry) = self.peek(connection_id, database) {
            if entry.is_fresh(now, self.ttl) {
                return Ok(Some(entry));
            }
        }
        self.refresh_at(connection_id, database, now).await
    }

    async fn refresh_at(
        &self,
        connection_id: &str,
        database: &str,
        now: Instant,
    ) -> Result<Option<Arc<SchemaCacheEntry>>, SchemaCacheError> {
        let key = (connection_id.to_string(), database.to_string());
        {
            let mut state = self.state();
            if !state.refreshing.insert(key.clone()) {
                tracing::debug!(
                    connection_id,
                    database,
                    "schema refresh already in flight, using cached state"
                );
                return Ok(state.entries.get(&key).cloned());
            }
        }
        let guard = RefreshGuard { cache: self, key };

        let entry = Arc::new(self.fetch(connection_id, database, now).await?);
        self.state()
            .entries
            .insert(guard.key.clone(), Arc::clone(&entry));
        drop(guard);
        Ok(Some(entry))
    }

    async fn fetch(
        &self,
        connection_id: &str,
        database: &str,
        now: Instant,
    ) -> Result<SchemaCacheEntry, SchemaCacheError> {
        let objects = self
            .transport
            .list_child_objects(connection_id, database)
            .await
            .map_err(|source| SchemaCacheError::Transport {
                database: database.to_string(),
                source,
            })?;

        let mut fields = BTreeMap::new();
        let mut tags = BTreeMap::new();
        for object in objects.iter().take(self.max_objects) {
            let path = join(database, object);
            match self.transport.list_fields(connection_id, &path).await {
                Ok(listed) => {
                    fields.insert(
                        object.clone(),
                        listed.into_iter().map(|field| field.name).collect(),
                    );
                }
                Err(error) => {
                    tracing::warn!(connection_id, object = %path, %error, "skipping object fields");
                }
            }
            match self.transport.list_tags(connection_id, &path).await {
                Ok(listed) => {
                    tags.insert(
                        object.clone(),
                        listed.into_iter().map(|tag| tag.name).collect(),
                    );
                }
                Err(error) => {
                    tracing::warn!(connection_id, object = %path, %error, "skipping object tags");
                }
            }
        }

        tracing::debug!(
            connection_id,
            database,
            objects = objects.len(),
            described = fields.len(),
            "schema cache refreshed"
        );
        Ok(SchemaCacheEntry {
            database: database.to_string(),
            objects,
            fields,
            tags,
            refreshed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{SchemaCache, SchemaCacheError};
    use crate::test_transport::ScriptedTransport;

    fn telegraf() -> ScriptedTransport {
        ScriptedTransport::new()
            .with_children("telegraf", &["cpu", "mem", "disk"])
            .with_fields("telegraf.cpu", &["usage_idle", "usage_user"])
            .with_tags("telegraf.cpu", &["host", "cpu"])
            .with_fields("telegraf.mem", &["used", "free"])
    }

    #[tokio::test]
    async fn uses_cache_within_ttl() {
        let transport = Arc::new(telegraf());
        let cache = SchemaCache::new(transport.clone(), Duration::from_secs(60));
        let now = Instant::now();

        let first = cache
            .get_at("conn", "telegraf", now)
            .await
            .expect("first read should load schema")
            .expect("entry should exist");
        let second = cache
            .get_at("conn", "telegraf", now + Duration::from_secs(30))
            .await
            .expect("second read should use cache")
            .expect("entry should exist");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.listing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.objects, vec!["cpu", "mem", "disk"]);
        assert_eq!(first.fields_of("cpu"), ["usage_idle", "usage_user"]);
        assert_eq!(first.tags_of("telegraf.cpu"), ["host", "cpu"]);
        assert!(first.fields_of("disk").is_empty());
    }

    #[tokio::test]
    async fn expired_entry_is_refreshed() {
        let transport = Arc::new(telegraf());
        let cache = SchemaCache::new(transport.clone(), Duration::from_secs(60));
        let now = Instant::now();

        cache
            .get_at("conn", "telegraf", now)
            .await
            .expect("first read should load schema");
        cache
            .get_at("conn", "telegraf", now + Duration::from_secs(61))
            .await
            .expect("expired read should refresh");

        assert_eq!(transport.listing_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_object_is_skipped() {
        let transport = Arc::new(telegraf().failing_at("telegraf.mem"));
        let cache = SchemaCache::new(transport, Duration::from_secs(60));

        let entry = cache
            .get("conn", "telegraf")
            .await
            .expect("refresh should survive per-object failures")
            .expect("entry should exist");

        assert_eq!(entry.objects.len(), 3);
        assert!(entry.fields_of("mem").is_empty());
        assert_eq!(entry.all_fields(), vec!["usage_idle", "usage_user"]);
    }

    #[tokio::test]
    async fn listing_failure_surfaces_and_allows_retry() {
        let transport = Arc::new(telegraf().failing_at("telegraf"));
        let cache = SchemaCache::new(transport.clone(), Duration::from_secs(60));

        let error = cache
            .get("conn", "telegraf")
            .await
            .expect_err("listing failure should surface");
        assert!(matches!(error, SchemaCacheError::Transport { .. }));

        cache
            .get("conn", "telegraf")
            .await
            .expect_err("retry should hit the transport again");
        assert_eq!(transport.listing_calls.load(Ordering::SeqCst), 2);
        assert!(cache.state().refreshing.is_empty());
    }

    #[tokio::test]
    async fn in_flight_refresh_is_not_awaited() {
        let transport = Arc::new(telegraf());
        let cache = SchemaCache::new(transport.clone(), Duration::from_secs(60));
        cache
            .state()
            .refreshing
            .insert(("conn".to_string(), "telegraf".to_string()));

        let entry = cache
            .get("conn", "telegraf")
            .await
            .expect("in-flight refresh should not fail");

        assert!(entry.is_none());
        assert_eq!(transport.listing_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn describes_at_most_max_objects() {
        let cache = SchemaCache::new(Arc::new(telegraf()), Duration::from_secs(60))
            .with_max_objects(1);

        let entry = cache
            .get("conn", "telegraf")
            .await
            .expect("refresh should succeed")
            .expect("entry should exist");

        assert_eq!(entry.objects.len(), 3);
        assert_eq!(entry.fields.len(), 1);
        assert!(entry.fields_of("mem").is_empty());
    }

    #[tokio::test]
    async fn invalidate_and_clear_drop_entries() {
        let transport = Arc::new(telegraf());
        let cache = SchemaCache::new(transport.clone(), Duration::from_secs(60));

        cache.get("a", "telegraf").await.expect("refresh a");
        cache.get("b", "telegraf").await.expect("refresh b");
        cache.invalidate("a", "telegraf");
        assert!(cache.peek("a", "telegraf").is_none());
        assert!(cache.peek("b", "telegraf").is_some());

        cache.clear();
        assert!(cache.peek("b", "telegraf").is_none());
        cache.get("b", "telegraf").await.expect("refresh b again");
        assert_eq!(transport.listing_calls.load(Ordering::SeqCst), 3);
    }
}
