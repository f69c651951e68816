//! # Subscription Routing
//!
//! Devices push events and notifications without being asked. The router maps
//! the device-side key of a pushed message (an ADS notification handle, an S7
//! event type) to the subscriptions that asked for it.

use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// One pushed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    /// The item name given at subscription time.
    pub name: String,
    pub timestamp: SystemTime,
    pub value: Vec<u8>,
}

/// Identifies a live subscription for `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub names: Vec<String>,
}

/// A subscription and the stream its events arrive on.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

struct Route {
    subscription: u64,
    name: String,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

pub(crate) struct Router<K> {
    routes: DashMap<K, Vec<Route>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash + Clone> Router<K> {
    pub(crate) fn new() -> Self {
        Self { routes: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn add(&self, key: K, subscription: u64, name: String, tx: mpsc::UnboundedSender<SubscriptionEvent>) {
        self.routes.entry(key).or_default().push(Route { subscription, name, tx });
    }

    /// Removes every route of `subscription`, returning their keys and names.
    pub(crate) fn remove(&self, subscription: u64) -> Vec<(K, String)> {
        let mut removed = Vec::new();
        self.routes.retain(|key, routes| {
            routes.retain(|route| {
                if route.subscription != subscription {
                    return true;
                }
                removed.push((key.clone(), route.name.clone()));
                false
            });
            !routes.is_empty()
        });
        removed
    }

    /// Hands a pushed value to every subscriber of `key`. Returns how many got it.
    pub(crate) fn deliver(&self, key: &K, timestamp: SystemTime, value: &[u8]) -> usize {
        let Some(routes) = self.routes.get(key) else {
            return 0;
        };
        routes
            .iter()
            .filter(|route| {
                let event = SubscriptionEvent { name: route.name.clone(), timestamp, value: value.to_vec() };
                route.tx.send(event).is_ok()
            })
            .count()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, subscription: u64) -> bool {
        self.routes.iter().any(|routes| routes.iter().any(|r| r.subscription == subscription))
    }
}
