//! Time-bounded cache of object describes.

use super::ObjectDescribe;
use crate::session::SessionManager;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::debug;

/// One cache generation for one object. Concurrent callers share the cell,
/// so only the first of them reaches the remote.
#[derive(Default)]
struct CacheSlot {
    cell: OnceCell<(Arc<ObjectDescribe>, Instant)>,
}

impl CacheSlot {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        match self.cell.get() {
            Some((_, fetched_at)) => now.duration_since(*fetched_at) >= ttl,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Objects with a describe currently held, sorted
    pub objects: Vec<String>,
    pub cached_objects: usize,
    /// Remote fetches since the cache was created
    pub fetches: u64,
}

pub struct MetadataCache {
    session: Arc<SessionManager>,
    ttl: Duration,
    entries: DashMap<String, Arc<CacheSlot>>,
    fetches: AtomicU64,
}

impl MetadataCache {
    pub fn new(session: Arc<SessionManager>, ttl: Duration) -> Self {
        Self {
            session,
            ttl,
            entries: DashMap::new(),
            fetches: AtomicU64::new(0),
        }
    }

    /// Describe of `name`, fetched at most once per TTL window.
    pub async fn describe(&self, name: &str) -> Result<Arc<ObjectDescribe>> {
        let slot = {
            let now = Instant::now();
            let mut entry = self.entries.entry(name.to_string()).or_default();
            if entry.is_expired(self.ttl, now) {
                debug!(object = %name, "Describe expired, refetching");
                *entry = Arc::new(CacheSlot::default());
            }
            Arc::clone(entry.value())
        };

        let (describe, _) = slot
            .cell
            .get_or_try_init(|| async {
                self.fetches.fetch_add(1, Ordering::Relaxed);
                let api = self.session.api();
                let describe = self
                    .session
                    .with_session(|s| async move { api.describe(&s, name).await })
                    .await?;
                debug!(object = %name, fields = describe.fields.len(), "Fetched describe");
                Ok::<_, EngineError>((Arc::new(describe), Instant::now()))
            })
            .await?;

        Ok(Arc::clone(describe))
    }

    /// Describes for several objects, in the given order.
    pub async fn describe_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<ObjectDescribe>>> {
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.describe(name.as_ref()).await?);
        }
        Ok(out)
    }

    /// Start a new generation: every following lookup refetches.
    pub fn invalidate(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let mut objects: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().cell.initialized())
            .map(|e| e.key().clone())
            .collect();
        objects.sort();
        CacheStats {
            cached_objects: objects.len(),
            objects,
            fetches: self.fetches.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::remote::fake::FakeApi;

    fn cache(api: Arc<FakeApi>, ttl: Duration) -> MetadataCache {
        let session = SessionManager::new(api, Arc::new(FakeApi::credentials), SessionConfig::default());
        MetadataCache::new(Arc::new(session), ttl)
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let api = Arc::new(FakeApi::crm());
        let cache = cache(Arc::clone(&api), Duration::from_secs(600));

        let first = cache.describe("Account").await.unwrap();
        let second = cache.describe("Account").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(api.describe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_after_ttl() {
        let api = Arc::new(FakeApi::crm());
        let cache = cache(Arc::clone(&api), Duration::from_secs(60));

        cache.describe("Account").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        cache.describe("Account").await.unwrap();

        assert_eq!(api.describe_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let api = Arc::new(FakeApi::crm());
        api.set_call_delay(Duration::from_millis(50));
        let cache = Arc::new(cache(Arc::clone(&api), Duration::from_secs(600)));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.describe("Contact").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(api.describe_calls(), 1);
        assert_eq!(cache.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_invalidate_starts_new_generation() {
        let api = Arc::new(FakeApi::crm());
        let cache = cache(Arc::clone(&api), Duration::from_secs(600));

        cache.describe_all(&["Account", "Contact"]).await.unwrap();
        assert_eq!(cache.stats().objects, vec!["Account", "Contact"]);

        cache.invalidate();
        assert_eq!(cache.stats().cached_objects, 0);
        cache.describe("Account").await.unwrap();
        assert_eq!(api.describe_calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let api = Arc::new(FakeApi::crm());
        let cache = cache(Arc::clone(&api), Duration::from_secs(600));

        assert!(cache.describe("Opportunity").await.is_err());
        assert_eq!(cache.stats().cached_objects, 0);
    }
}
