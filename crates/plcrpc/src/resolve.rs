//! # Resolution Cache
//!
//! Turns symbolic keys into their direct form, once.
//!
//! ## Architecture
//!
//! - **Resolved map**: keys already resolved are answered without I/O.
//! - **Pending map**: a key being resolved maps to a `Shared` future. Every
//!   concurrent caller awaits the same future, so one lookup serves them all.
//! - **Batching**: the keys first seen in one `resolve_all` call go out as one
//!   request. One key uses [`Resolve::resolve_one`], several use
//!   [`Resolve::resolve_batch`].
//! - **Detached work**: the lookup runs on its own task and completes even when
//!   every caller has given up.
//!
//! Both maps live under one lock. The lookup task moves finished keys from
//! pending to resolved in a single critical section, so a key is never in
//! neither map while its lookup is outstanding. A lookup task that dies
//! early still clears its pending keys.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Either;
use futures::future::Shared;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;

/// Performs the actual lookup exchange with the device.
#[async_trait::async_trait]
pub trait Resolve<K, V>: Send + Sync + 'static {
    /// Resolves a single key.
    async fn resolve_one(&self, key: &K) -> Result<V>;

    /// Resolves several keys in one request.
    ///
    /// Returns one result per key, in the order given. An `Err` for the whole
    /// call fails every key; an `Err` inside the vector fails only that key.
    async fn resolve_batch(&self, keys: &[K]) -> Result<Vec<Result<V>>>;
}

type Pending<V> = Shared<BoxFuture<'static, Result<V>>>;

struct Maps<K, V> {
    resolved: HashMap<K, V>,
    pending: HashMap<K, Pending<V>>,
}

/// Deduplicating cache in front of a [`Resolve`] implementation.
pub struct ResolutionCache<K, V> {
    resolver: Arc<dyn Resolve<K, V>>,
    maps: Arc<Mutex<Maps<K, V>>>,
}

impl<K, V> ResolutionCache<K, V>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(resolver: Arc<dyn Resolve<K, V>>) -> Self {
        Self {
            resolver,
            maps: Arc::new(Mutex::new(Maps { resolved: HashMap::new(), pending: HashMap::new() })),
        }
    }

    /// Resolves one key.
    pub async fn resolve(&self, key: &K) -> Result<V> {
        self.resolve_all(std::slice::from_ref(key))
            .await?
            .into_iter()
            .next()
            .ok_or(Error::ChannelClosed)
    }

    /// Resolves every key, returning the values in order.
    ///
    /// Fails with the first key's error if any key cannot be resolved.
    pub async fn resolve_all(&self, keys: &[K]) -> Result<Vec<V>> {
        let mut waits = Vec::with_capacity(keys.len());
        let mut fresh = Vec::new();
        {
            let mut maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
            for key in keys {
                if let Some(value) = maps.resolved.get(key) {
                    waits.push(Either::Left(futures::future::ready(Ok(value.clone()))));
                    continue;
                }
                if let Some(pending) = maps.pending.get(key) {
                    waits.push(Either::Right(pending.clone()));
                    continue;
                }
                let (tx, rx) = oneshot::channel::<Result<V>>();
                let pending: Pending<V> = rx.map(|r| r.unwrap_or(Err(Error::ChannelClosed))).boxed().shared();
                maps.pending.insert(key.clone(), pending.clone());
                waits.push(Either::Right(pending));
                fresh.push((key.clone(), tx));
            }
        }

        if !fresh.is_empty() {
            let lookup = Lookup { maps: self.maps.clone(), fresh };
            tokio::spawn(Self::lookup_task(self.resolver.clone(), lookup));
        }

        futures::future::join_all(waits).await.into_iter().collect()
    }

    async fn lookup_task(resolver: Arc<dyn Resolve<K, V>>, lookup: Lookup<K, V>) {
        let keys = lookup.keys();
        tracing::debug!(keys = keys.len(), "resolving");

        let results: Vec<Result<V>> = match keys.as_slice() {
            [key] => vec![resolver.resolve_one(key).await],
            _ => match resolver.resolve_batch(&keys).await {
                Ok(results) if results.len() == keys.len() => results,
                Ok(results) => {
                    let reason = format!("expected {} results, got {}", keys.len(), results.len());
                    keys.iter().map(|key| Err(Error::resolution(key, reason.clone()))).collect()
                }
                Err(error) => keys.iter().map(|_| Err(error.clone())).collect(),
            },
        };

        lookup.complete(results);
    }

    /// Returns the resolved form if it is already known.
    pub fn lookup(&self, key: &K) -> Option<V> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner()).resolved.get(key).cloned()
    }

    /// Forgets a resolved key so the next caller resolves it again.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner()).resolved.remove(key)
    }

    /// Number of keys with a lookup in flight.
    pub fn pending(&self) -> usize {
        self.maps.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }
}

/// The reply slots of one lookup.
///
/// If the lookup task dies before completing (a panicking resolver, a runtime
/// shutting down), dropping this clears its pending entries first and then
/// fails the waiters, so the next caller starts a fresh lookup.
struct Lookup<K: Eq + Hash + fmt::Debug, V> {
    maps: Arc<Mutex<Maps<K, V>>>,
    fresh: Vec<(K, oneshot::Sender<Result<V>>)>,
}

impl<K: Eq + Hash + Clone + fmt::Debug, V: Clone> Lookup<K, V> {
    fn keys(&self) -> Vec<K> {
        self.fresh.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Moves finished keys out of pending in one critical section, then
    /// answers the waiters.
    fn complete(mut self, results: Vec<Result<V>>) {
        let fresh = std::mem::take(&mut self.fresh);
        {
            let mut maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
            for ((key, _), result) in fresh.iter().zip(&results) {
                match result {
                    Ok(value) => {
                        maps.resolved.insert(key.clone(), value.clone());
                    }
                    Err(error) => tracing::debug!(?key, %error, "resolution failed"),
                }
                maps.pending.remove(key);
            }
        }

        for ((_, tx), result) in fresh.into_iter().zip(results) {
            let _ = tx.send(result);
        }
    }
}

impl<K: Eq + Hash + fmt::Debug, V> Drop for Lookup<K, V> {
    fn drop(&mut self) {
        if self.fresh.is_empty() {
            return;
        }
        let fresh = std::mem::take(&mut self.fresh);
        {
            let mut maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
            for (key, _) in &fresh {
                maps.pending.remove(key);
            }
        }
        tracing::warn!(keys = fresh.len(), "lookup abandoned before completing");
        for (key, tx) in fresh {
            let _ = tx.send(Err(Error::resolution(&key, "lookup abandoned")));
        }
    }
}

impl<K, V> fmt::Debug for ResolutionCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let maps = self.maps.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ResolutionCache")
            .field("resolved", &maps.resolved.len())
            .field("pending", &maps.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    /// Upper-cases names; anything starting with `missing` is not found.
    #[derive(Default)]
    struct Upper {
        singles: AtomicUsize,
        batches: AtomicUsize,
    }

    fn upper(key: &String) -> Result<String> {
        if key.starts_with("missing") {
            return Err(Error::resolution(key, "symbol not found"));
        }
        Ok(key.to_uppercase())
    }

    #[async_trait::async_trait]
    impl Resolve<String, String> for Upper {
        async fn resolve_one(&self, key: &String) -> Result<String> {
            self.singles.fetch_add(1, Ordering::SeqCst);
            upper(key)
        }

        async fn resolve_batch(&self, keys: &[String]) -> Result<Vec<Result<String>>> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(keys.iter().map(upper).collect())
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_resolved_key_needs_no_request() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());

        assert_eq!(cache.resolve(&"tag.a".to_string()).await.unwrap(), "TAG.A");
        assert_eq!(cache.resolve(&"tag.a".to_string()).await.unwrap(), "TAG.A");

        assert_eq!(resolver.singles.load(Ordering::SeqCst), 1);
        assert_eq!(cache.lookup(&"tag.a".to_string()).as_deref(), Some("TAG.A"));
    }

    #[tokio::test]
    async fn test_fresh_keys_of_one_call_form_one_batch() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());

        let values = cache.resolve_all(&keys(&["a", "b", "c"])).await.unwrap();

        assert_eq!(values, keys(&["A", "B", "C"]));
        assert_eq!(resolver.batches.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.singles.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_only_resolves_unknown_keys() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());
        cache.resolve(&"a".to_string()).await.unwrap();

        cache.resolve_all(&keys(&["a", "b"])).await.unwrap();

        // "a" was known, so "b" went out alone.
        assert_eq!(resolver.singles.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_item_fails_only_its_waiters() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());

        let err = cache.resolve_all(&keys(&["ok", "missing.x"])).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }));

        assert_eq!(cache.lookup(&"ok".to_string()).as_deref(), Some("OK"));
        assert_eq!(cache.lookup(&"missing.x".to_string()), None);
        assert_eq!(cache.pending(), 0);
    }

    #[tokio::test]
    async fn test_failure_and_invalidate_allow_re_resolution() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());

        assert!(cache.resolve(&"missing".to_string()).await.is_err());
        assert!(cache.resolve(&"missing".to_string()).await.is_err());
        assert_eq!(resolver.singles.load(Ordering::SeqCst), 2);

        cache.resolve(&"b".to_string()).await.unwrap();
        assert_eq!(cache.invalidate(&"b".to_string()).as_deref(), Some("B"));
        cache.resolve(&"b".to_string()).await.unwrap();
        assert_eq!(resolver.singles.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let resolver = Arc::new(Upper::default());
        let cache = ResolutionCache::new(resolver.clone());
        let key = "missing.k".to_string();

        let (a, b, c) = tokio::join!(cache.resolve(&key), cache.resolve(&key), cache.resolve(&key));

        assert_eq!(resolver.singles.load(Ordering::SeqCst), 1);
        for outcome in [a, b, c] {
            match outcome {
                Err(Error::Resolution { key, reason }) => {
                    assert_eq!(key, "\"missing.k\"");
                    assert_eq!(reason, "symbol not found");
                }
                other => panic!("expected a resolution error, got {:?}", other),
            }
        }
        assert_eq!(cache.pending(), 0);
        assert_eq!(cache.lookup(&key), None);
    }

    /// Panics on its first lookup, then behaves.
    #[derive(Default)]
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Resolve<String, String> for PanicsOnce {
        async fn resolve_one(&self, key: &String) -> Result<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("resolver crashed");
            }
            Ok(key.to_uppercase())
        }

        async fn resolve_batch(&self, keys: &[String]) -> Result<Vec<Result<String>>> {
            Ok(keys.iter().map(|key| Ok(key.to_uppercase())).collect())
        }
    }

    #[tokio::test]
    async fn test_crashed_lookup_does_not_wedge_the_key() {
        let resolver = Arc::new(PanicsOnce::default());
        let cache = ResolutionCache::new(resolver.clone());
        let key = "k".to_string();

        let err = cache.resolve(&key).await.unwrap_err();
        assert!(matches!(err, Error::Resolution { .. }), "got {:?}", err);
        assert_eq!(cache.pending(), 0);

        assert_eq!(cache.resolve(&key).await.unwrap(), "K");
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.pending(), 0);
    }
}
