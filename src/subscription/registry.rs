// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscriber and listener bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::listener::{Listener, ListenerMode, PollSettings};
use super::Subscriber;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::event::EventBatch;
use crate::protocol::DeviceConnector;
use crate::reader::AttributeReader;
use crate::types::{AttributeKey, SubscriberId};

/// Exclusive hold on one attribute key.
///
/// Dropping the guard retires the key's lock entry if the key has no
/// listener, including when the holding future is cancelled.
struct KeyGuard<'a, C: DeviceConnector> {
    registry: &'a SubscriptionRegistry<C>,
    key: AttributeKey,
    lock: Arc<AsyncMutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl<C: DeviceConnector> Drop for KeyGuard<'_, C> {
    fn drop(&mut self) {
        // Runs before `_guard` is dropped, so the key is still held here.
        if self.registry.has_listener(&self.key) {
            return;
        }
        let mut locks = self.registry.key_locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock))
        {
            locks.remove(&self.key);
        }
    }
}

/// Tracks connected subscribers and the listener behind every attribute
/// they watch.
///
/// The registry maintains two invariants:
///
/// - an attribute has a listener exactly while it has at least one
///   subscriber;
/// - there is never more than one listener per attribute.
///
/// Operations on the same attribute are serialized with a per-key async
/// lock, so concurrent subscribe and unsubscribe calls cannot race a
/// listener's creation or teardown. Operations on different attributes
/// proceed in parallel.
pub struct SubscriptionRegistry<C: DeviceConnector> {
    reader: Arc<AttributeReader<C>>,
    settings: PollSettings,
    subscribers: RwLock<HashMap<SubscriberId, Arc<Subscriber>>>,
    listeners: Mutex<HashMap<AttributeKey, Listener<C::Handle>>>,
    key_locks: Mutex<HashMap<AttributeKey, Arc<AsyncMutex<()>>>>,
}

impl<C: DeviceConnector> SubscriptionRegistry<C> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(reader: Arc<AttributeReader<C>>, config: &GatewayConfig) -> Self {
        Self {
            reader,
            settings: PollSettings::from(config),
            subscribers: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Subscribers
    // ========================================================================

    /// Registers a new subscriber and returns it.
    pub fn register(&self) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber::new(SubscriberId::new()));
        self.subscribers
            .write()
            .insert(subscriber.id(), Arc::clone(&subscriber));
        tracing::debug!(subscriber = %subscriber.id(), "Subscriber connected");
        subscriber
    }

    /// Returns a connected subscriber.
    #[must_use]
    pub fn subscriber(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.read().get(&id).cloned()
    }

    fn connected(&self, id: SubscriberId) -> Result<Arc<Subscriber>> {
        self.subscriber(id).ok_or(Error::SubscriberNotFound(id))
    }

    /// Returns the number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Takes everything buffered for a subscriber since the last drain.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the subscriber is not
    /// connected.
    pub fn drain(&self, id: SubscriberId) -> Result<EventBatch> {
        Ok(self.connected(id)?.drain())
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribes a subscriber to an attribute.
    ///
    /// The first subscription to an attribute starts its listener; later
    /// ones join it and are primed with its latest value and config.
    /// Subscribing twice to the same attribute is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the subscriber is not
    /// connected, or `Error::SubscriberClosed` if it was disconnected while
    /// the subscription was being set up.
    pub async fn subscribe(&self, key: &AttributeKey, id: SubscriberId) -> Result<()> {
        let subscriber = self.connected(id)?;
        if subscriber.is_closed() {
            return Err(Error::SubscriberClosed(id));
        }

        let _guard = self.lock_key(key).await;

        let existing = self.listeners.lock().contains_key(key);
        if !existing {
            let listener = Listener::start(key, &self.reader, self.settings).await;
            tracing::debug!(%key, mode = %listener.mode(), "Listener started");
            self.listeners.lock().insert(key.clone(), listener);
        }

        let joined = self
            .listeners
            .lock()
            .get(key)
            .is_some_and(|listener| listener.join(&subscriber));
        if joined {
            subscriber.add_key(key);
            tracing::debug!(%key, subscriber = %id, "Subscribed");
        }

        // A concurrent disconnect may have swept the subscriber's keys
        // before this one was added.
        if subscriber.is_closed() {
            self.detach(key, &subscriber);
            return Err(Error::SubscriberClosed(id));
        }

        Ok(())
    }

    /// Unsubscribes a subscriber from an attribute.
    ///
    /// Tears the listener down if this was its last subscriber. Returns
    /// `false` if the subscriber was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the subscriber is not
    /// connected.
    pub async fn unsubscribe(&self, key: &AttributeKey, id: SubscriberId) -> Result<bool> {
        let subscriber = self.connected(id)?;

        let removed = {
            let _guard = self.lock_key(key).await;
            self.detach(key, &subscriber)
        };

        if removed {
            tracing::debug!(%key, subscriber = %id, "Unsubscribed");
        }
        Ok(removed)
    }

    /// Disconnects a subscriber, removing every subscription it holds.
    ///
    /// Idempotent: returns `false` if the subscriber was already gone.
    ///
    /// The subscriber stays registered until its last subscription is
    /// detached, so a disconnect that is cancelled part way can be finished
    /// by calling it again.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        let Some(subscriber) = self.subscriber(id) else {
            return false;
        };
        subscriber.close();

        let mut count = 0_usize;
        while let Some(key) = subscriber.first_key() {
            let _guard = self.lock_key(&key).await;
            // Removes `key` from the subscriber even without a listener.
            self.detach(&key, &subscriber);
            count += 1;
        }

        let removed = self.subscribers.write().remove(&id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, subscriptions = count, "Subscriber disconnected");
        }
        removed
    }

    /// Removes a membership and tears down the listener if it became empty.
    ///
    /// Must be called with the key lock held.
    fn detach(&self, key: &AttributeKey, subscriber: &Subscriber) -> bool {
        subscriber.remove_key(key);

        let (removed, idle) = {
            let mut listeners = self.listeners.lock();
            let Some(listener) = listeners.get(key) else {
                return false;
            };
            let removed = listener.leave(subscriber.id());
            let idle = if listener.member_count() == 0 {
                listeners.remove(key)
            } else {
                None
            };
            (removed, idle)
        };

        if let Some(listener) = idle {
            tracing::debug!(%key, mode = %listener.mode(), "Last subscriber left, stopping listener");
            drop(listener);
        }
        removed
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Returns `true` if a listener is running for `key`.
    #[must_use]
    pub fn has_listener(&self, key: &AttributeKey) -> bool {
        self.listeners.lock().contains_key(key)
    }

    /// Returns how the listener for `key` receives events, if one exists.
    #[must_use]
    pub fn listener_mode(&self, key: &AttributeKey) -> Option<ListenerMode> {
        self.listeners.lock().get(key).map(Listener::mode)
    }

    /// Returns the number of running listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Returns the number of subscribers to `key`.
    #[must_use]
    pub fn member_count(&self, key: &AttributeKey) -> usize {
        self.listeners
            .lock()
            .get(key)
            .map_or(0, Listener::member_count)
    }

    // ========================================================================
    // Per-key locking
    // ========================================================================

    async fn lock_key(&self, key: &AttributeKey) -> KeyGuard<'_, C> {
        loop {
            let lock = Arc::clone(self.key_locks.lock().entry(key.clone()).or_default());
            let guard = Arc::clone(&lock).lock_owned().await;

            // The entry may have been retired while we waited.
            let current = self
                .key_locks
                .lock()
                .get(key)
                .is_some_and(|entry| Arc::ptr_eq(entry, &lock));
            if current {
                return KeyGuard {
                    registry: self,
                    key: key.clone(),
                    lock,
                    _guard: guard,
                };
            }
        }
    }
}

impl<C: DeviceConnector> std::fmt::Debug for SubscriptionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("subscribers", &self.subscriber_count())
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use crate::event::{EventKind, EventPayload};
    use crate::protocol::{HandlePool, MemoryConnector};
    use serde_json::json;
    use std::time::Duration;

    fn key(s: &str) -> AttributeKey {
        AttributeKey::new(s).unwrap()
    }

    fn registry_with(
        devices: &MemoryConnector,
        config: &GatewayConfig,
    ) -> SubscriptionRegistry<MemoryConnector> {
        let pool = Arc::new(HandlePool::new(devices.clone(), config.pool_capacity));
        SubscriptionRegistry::new(Arc::new(AttributeReader::new(pool)), config)
    }

    fn registry(devices: &MemoryConnector) -> SubscriptionRegistry<MemoryConnector> {
        registry_with(devices, &GatewayConfig::default())
    }

    fn latest_value(subscriber: &Subscriber, key: &AttributeKey) -> Option<serde_json::Value> {
        subscriber
            .drain()
            .get(EventKind::Change, key)
            .and_then(|record| record.value().map(|v| v.value.clone()))
    }

    #[tokio::test]
    async fn one_listener_per_attribute() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        let b = registry.register();

        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        registry.subscribe(&key("dev1/temp"), b.id()).await.unwrap();

        assert_eq!(registry.listener_count(), 1);
        assert_eq!(registry.member_count(&key("dev1/temp")), 2);
        assert_eq!(registry.listener_mode(&key("dev1/temp")), Some(ListenerMode::Push));
        assert_eq!(devices.registration_count(&key("dev1/temp")), 1);
    }

    #[tokio::test]
    async fn concurrent_first_subscriptions_share_one_listener() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let subscribers: Vec<_> = (0..8).map(|_| registry.register()).collect();
        let temp = key("dev1/temp");

        let results = futures::future::join_all(
            subscribers
                .iter()
                .map(|subscriber| registry.subscribe(&temp, subscriber.id())),
        )
        .await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(devices.registration_count(&key("dev1/temp")), 1);
        assert_eq!(registry.member_count(&key("dev1/temp")), 8);
    }

    #[tokio::test]
    async fn subscribing_twice_is_a_noop() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();

        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();

        assert_eq!(registry.member_count(&key("dev1/temp")), 1);
        assert_eq!(a.keys(), vec![key("dev1/temp")]);
    }

    #[tokio::test]
    async fn pushed_events_reach_subscribers() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();

        devices.set_value(&key("dev1/temp"), 21);
        devices.set_value(&key("dev1/temp"), 22);

        assert_eq!(latest_value(&a, &key("dev1/temp")), Some(json!(22)));
    }

    #[tokio::test]
    async fn late_joiner_is_primed() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        devices.set_value(&key("dev1/temp"), 25);

        let b = registry.register();
        registry.subscribe(&key("dev1/temp"), b.id()).await.unwrap();

        let batch = b.drain();
        assert!(batch.get(EventKind::Config, &key("dev1/temp")).is_some());
        let change = batch.get(EventKind::Change, &key("dev1/temp")).unwrap();
        assert_eq!(change.value().unwrap().value, json!(25));
    }

    #[tokio::test]
    async fn last_unsubscribe_releases_listener() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        let b = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        registry.subscribe(&key("dev1/temp"), b.id()).await.unwrap();

        assert!(registry.unsubscribe(&key("dev1/temp"), a.id()).await.unwrap());
        assert!(registry.has_listener(&key("dev1/temp")));

        assert!(registry.unsubscribe(&key("dev1/temp"), b.id()).await.unwrap());
        assert!(!registry.has_listener(&key("dev1/temp")));
        assert_eq!(devices.registration_count(&key("dev1/temp")), 0);
        assert_eq!(devices.release_count(), 1);

        assert!(!registry.unsubscribe(&key("dev1/temp"), b.id()).await.unwrap());
    }

    #[tokio::test]
    async fn unsubscribe_discards_pending_events() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        devices.set_value(&key("dev1/temp"), 21);

        registry.unsubscribe(&key("dev1/temp"), a.id()).await.unwrap();

        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn disconnect_tears_down_only_orphaned_listeners() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        devices.insert(&key("dev2/pressure"), 1013);
        let registry = registry(&devices);
        let a = registry.register();
        let b = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        registry.subscribe(&key("dev2/pressure"), a.id()).await.unwrap();
        registry.subscribe(&key("dev1/temp"), b.id()).await.unwrap();

        assert!(registry.disconnect(a.id()).await);

        assert!(a.is_closed());
        assert!(registry.has_listener(&key("dev1/temp")));
        assert!(!registry.has_listener(&key("dev2/pressure")));
        assert_eq!(registry.member_count(&key("dev1/temp")), 1);
        assert_eq!(registry.subscriber_count(), 1);

        assert!(!registry.disconnect(a.id()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_disconnect_can_be_completed() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        devices.insert(&key("dev2/pressure"), 1013);
        let registry = registry(&devices);
        let a = registry.register();
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        registry.subscribe(&key("dev2/pressure"), a.id()).await.unwrap();

        // Keep dev2/pressure busy so the disconnect stalls on it.
        let busy = registry.lock_key(&key("dev2/pressure")).await;
        let stalled =
            tokio::time::timeout(Duration::from_millis(5), registry.disconnect(a.id())).await;
        assert!(stalled.is_err());
        drop(busy);

        assert!(a.is_closed());
        assert!(!registry.has_listener(&key("dev1/temp")));
        assert_eq!(registry.member_count(&key("dev2/pressure")), 1);

        assert!(registry.disconnect(a.id()).await);
        assert!(!registry.has_listener(&key("dev2/pressure")));
        assert_eq!(registry.member_count(&key("dev2/pressure")), 0);
        assert_eq!(devices.registration_count(&key("dev2/pressure")), 0);
        assert_eq!(registry.subscriber_count(), 0);
        assert!(a.keys().is_empty());
        assert!(!registry.disconnect(a.id()).await);
    }

    #[tokio::test]
    async fn closed_subscriber_cannot_subscribe() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        let registry = registry(&devices);
        let a = registry.register();
        a.close();

        assert!(matches!(
            registry.subscribe(&key("dev1/temp"), a.id()).await,
            Err(Error::SubscriberClosed(_))
        ));
        assert!(!registry.has_listener(&key("dev1/temp")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_subscribe_retires_key_lock() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 20);
        devices.set_connect_delay(Duration::from_secs(1));
        let registry = registry(&devices);
        let a = registry.register();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(10),
            registry.subscribe(&key("dev1/temp"), a.id()),
        )
        .await;
        assert!(cancelled.is_err());

        assert!(registry.key_locks.lock().is_empty());
        assert!(!registry.has_listener(&key("dev1/temp")));
        assert!(a.keys().is_empty());

        devices.set_connect_delay(Duration::ZERO);
        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        assert_eq!(registry.listener_mode(&key("dev1/temp")), Some(ListenerMode::Push));

        registry.unsubscribe(&key("dev1/temp"), a.id()).await.unwrap();
        assert!(registry.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn unknown_subscriber_is_rejected() {
        let devices = MemoryConnector::new();
        let registry = registry(&devices);
        let id = SubscriberId::new();

        assert!(matches!(
            registry.subscribe(&key("dev1/temp"), id).await,
            Err(Error::SubscriberNotFound(_))
        ));
        assert!(matches!(registry.drain(id), Err(Error::SubscriberNotFound(_))));
        assert!(!registry.has_listener(&key("dev1/temp")));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_polling_and_emits_on_change() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 1);
        devices.set_push_enabled(false);
        let config = GatewayConfig::default().with_poll_interval(Duration::from_secs(3));
        let registry = registry_with(&devices, &config);
        let a = registry.register();

        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        assert_eq!(registry.listener_mode(&key("dev1/temp")), Some(ListenerMode::Poll));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(latest_value(&a, &key("dev1/temp")), Some(json!(1)));

        // Unchanged readings are not re-emitted
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(a.drain().is_empty());

        devices.set_value(&key("dev1/temp"), 2);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(latest_value(&a, &key("dev1/temp")), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn polling_reports_one_error_per_failure_streak() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 1);
        devices.set_online("dev1", false);
        let config = GatewayConfig::default()
            .with_max_poll_failures(3)
            .with_poll_backoff(Duration::from_secs(1));
        let registry = registry_with(&devices, &config);
        let a = registry.register();

        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        assert_eq!(registry.listener_mode(&key("dev1/temp")), Some(ListenerMode::Poll));

        // Failures at 0s and 1s stay silent, the third at 2s is reported
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(a.drain().is_empty());
        tokio::time::sleep(Duration::from_secs(1)).await;
        let batch = a.drain();
        assert_eq!(batch.len(), 1);
        let error = batch.get(EventKind::Error, &key("dev1/temp")).unwrap();
        assert!(matches!(&error.payload, EventPayload::Error(message) if message.contains("unreachable")));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(a.drain().is_empty());

        devices.set_online("dev1", true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(latest_value(&a, &key("dev1/temp")), Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_attribute_stops_polling() {
        let devices = MemoryConnector::new();
        let registry = registry(&devices);
        let a = registry.register();

        registry.subscribe(&key("dev1/missing"), a.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let batch = a.drain();
        let error = batch.get(EventKind::Error, &key("dev1/missing")).unwrap();
        assert_eq!(
            error.payload,
            EventPayload::Error(DeviceError::attribute_not_found("dev1/missing").to_string())
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(devices.read_count(&key("dev1/missing")), 1);
        assert!(a.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_stops_poll_task() {
        let devices = MemoryConnector::new();
        devices.insert(&key("dev1/temp"), 1);
        devices.set_push_enabled(false);
        let registry = registry(&devices);
        let a = registry.register();

        registry.subscribe(&key("dev1/temp"), a.id()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        registry.unsubscribe(&key("dev1/temp"), a.id()).await.unwrap();
        let reads = devices.read_count(&key("dev1/temp"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(devices.read_count(&key("dev1/temp")), reads);
    }
}
