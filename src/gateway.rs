// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The gateway facade.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::TtlCache;
use crate::config::GatewayConfig;
use crate::delivery::DeliveryLoop;
use crate::error::{DeviceError, Result, ValueError};
use crate::event::EventBatch;
use crate::protocol::{DeviceConnector, DeviceHandle, HandlePool};
use crate::reader::AttributeReader;
use crate::subscription::SubscriptionRegistry;
use crate::types::{AttributeConfig, AttributeKey, AttributeValue, SubscriberId};

/// Live-attribute gateway over one device connector.
///
/// The `Gateway` owns every component: the handle pool, the coalescing
/// reader, the metadata cache and the subscription registry. Build one at
/// startup and share it behind an `Arc`.
///
/// # Features
///
/// - **Shared reads**: concurrent reads of an attribute cost one device call
/// - **One listener per attribute**: however many clients subscribe
/// - **Push or poll**: attributes without push support are polled
/// - **Batched delivery**: clients receive the latest event per attribute
///   and kind once per delivery interval
///
/// # Examples
///
/// ```no_run
/// use attrgate::{AttributeKey, Gateway, GatewayConfig, protocol::MemoryConnector};
///
/// #[tokio::main]
/// async fn main() -> attrgate::Result<()> {
///     let devices = MemoryConnector::new();
///     let gateway = Gateway::new(devices, GatewayConfig::default())?;
///
///     let temp: AttributeKey = "dev1/temp".parse()?;
///     let mut session = gateway.connect_client();
///     gateway.subscribe(&temp, session.id()).await?;
///
///     while let Some(batch) = session.recv().await {
///         for event in &batch {
///             println!("{} {}", event.kind(), event.key);
///         }
///     }
///     Ok(())
/// }
/// ```
pub struct Gateway<C: DeviceConnector> {
    config: GatewayConfig,
    pool: Arc<HandlePool<C>>,
    reader: Arc<AttributeReader<C>>,
    registry: Arc<SubscriptionRegistry<C>>,
    metadata: TtlCache<AttributeKey, AttributeConfig>,
}

impl<C: DeviceConnector> Gateway<C> {
    /// Creates a gateway.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid.
    pub fn new(connector: C, config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(HandlePool::new(connector, config.pool_capacity));
        let reader = Arc::new(AttributeReader::new(Arc::clone(&pool)));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::clone(&reader), &config));

        tracing::debug!(?config, "Gateway created");
        Ok(Self {
            config,
            pool,
            reader,
            registry,
            metadata: TtlCache::new(),
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Returns the subscription registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriptionRegistry<C>> {
        &self.registry
    }

    /// Returns the device handle pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<HandlePool<C>> {
        &self.pool
    }

    // =========================================================================
    // Clients
    // =========================================================================

    /// Connects a new client.
    ///
    /// Spawns the client's delivery loop on the current Tokio runtime. The
    /// returned session yields event batches; dropping it disconnects the
    /// client.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn connect_client(&self) -> ClientSession {
        let subscriber = self.registry.register();
        let id = subscriber.id();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity);

        let delivery = DeliveryLoop::new(subscriber, Arc::clone(&self.registry), tx, &self.config);
        tokio::spawn(delivery.run());

        ClientSession { id, receiver: rx }
    }

    /// Subscribes a client to an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the client is not connected.
    /// Device failures never surface here; they are delivered as ERROR
    /// events.
    pub async fn subscribe(&self, key: &AttributeKey, id: SubscriberId) -> Result<()> {
        self.registry.subscribe(key, id).await
    }

    /// Unsubscribes a client from an attribute.
    ///
    /// Returns `false` if the client was not subscribed.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the client is not connected.
    pub async fn unsubscribe(&self, key: &AttributeKey, id: SubscriberId) -> Result<bool> {
        self.registry.unsubscribe(key, id).await
    }

    /// Disconnects a client and drops all its subscriptions.
    ///
    /// Returns `false` if the client was already disconnected.
    pub async fn disconnect(&self, id: SubscriberId) -> bool {
        self.registry.disconnect(id).await
    }

    /// Takes a client's pending events without waiting for delivery.
    ///
    /// # Errors
    ///
    /// Returns `Error::SubscriberNotFound` if the client is not connected.
    pub fn drain(&self, id: SubscriberId) -> Result<EventBatch> {
        self.registry.drain(id)
    }

    /// Returns the number of connected clients.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Reads the current value of an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the read fails.
    pub async fn read(&self, key: &AttributeKey) -> Result<AttributeValue> {
        Ok(self.reader.read(key).await?)
    }

    /// Writes a scalar value to an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Error::Value` if `value` is not a boolean, number or
    /// string, or `Error::Device` if the write fails.
    pub async fn write(&self, key: &AttributeKey, value: Value) -> Result<()> {
        if !matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_)) {
            return Err(ValueError::NotScalar(value.to_string()).into());
        }

        let handle = self.pool.acquire(key.device()).await?;
        handle.write_attribute(key.attribute(), value).await?;
        tracing::debug!(%key, "Attribute written");
        Ok(())
    }

    /// Returns an attribute's metadata, cached for the configured TTL.
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the metadata cannot be fetched. Failures
    /// are not cached.
    pub async fn attribute_config(&self, key: &AttributeKey) -> Result<AttributeConfig> {
        let pool = Arc::clone(&self.pool);
        let target = key.clone();
        let config = self
            .metadata
            .get_or_compute(key.clone(), self.config.cache_ttl, move || async move {
                let handle = pool.acquire(target.device()).await?;
                let config = handle.attribute_config(target.attribute()).await?;
                Ok::<_, DeviceError>(config.normalized())
            })
            .await?;
        Ok(config)
    }
}

impl<C: DeviceConnector> std::fmt::Debug for Gateway<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// ClientSession
// =============================================================================

/// A connected client's end of its delivery channel.
///
/// Dropping the session disconnects the client: its delivery loop notices
/// the closed channel and removes every subscription.
#[derive(Debug)]
pub struct ClientSession {
    id: SubscriberId,
    receiver: mpsc::Receiver<EventBatch>,
}

impl ClientSession {
    /// Returns the ID to subscribe with.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next batch.
    ///
    /// Returns `None` once the client has been disconnected.
    pub async fn recv(&mut self) -> Option<EventBatch> {
        self.receiver.recv().await
    }

    /// Returns a batch if one is ready.
    pub fn try_recv(&mut self) -> Option<EventBatch> {
        self.receiver.try_recv().ok()
    }

    /// Closes the session.
    ///
    /// Batches already delivered can still be received; no new ones will
    /// arrive.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
