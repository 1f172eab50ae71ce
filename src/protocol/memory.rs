// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory devices.
//!
//! [`MemoryConnector`] simulates a set of devices without any I/O. It is
//! meant for tests and demos: values can be changed from the outside,
//! devices can be taken offline, push support can be switched off, and
//! every device call is counted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::{DeviceConnector, DeviceHandle, EventSink, ListenerHandle};
use crate::error::DeviceError;
use crate::types::{AttributeConfig, AttributeKey, AttributeValue};

#[derive(Debug, Clone)]
struct MemoryAttribute {
    value: AttributeValue,
    config: AttributeConfig,
}

#[derive(Debug)]
struct Registration {
    owner: u64,
    key: AttributeKey,
    sink: EventSink,
}

#[derive(Debug)]
struct Inner {
    attributes: Mutex<HashMap<AttributeKey, MemoryAttribute>>,
    offline: Mutex<HashSet<String>>,
    registrations: Mutex<HashMap<u64, Registration>>,
    push_enabled: AtomicBool,
    read_delay: Mutex<Duration>,
    connect_delay: Mutex<Duration>,
    next_handle: AtomicU64,
    next_connection: AtomicU64,
    connects: AtomicUsize,
    reads: Mutex<HashMap<AttributeKey, usize>>,
    writes: AtomicUsize,
    config_reads: AtomicUsize,
    releases: AtomicUsize,
    closes: AtomicUsize,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            attributes: Mutex::new(HashMap::new()),
            offline: Mutex::new(HashSet::new()),
            registrations: Mutex::new(HashMap::new()),
            push_enabled: AtomicBool::new(true),
            read_delay: Mutex::new(Duration::ZERO),
            connect_delay: Mutex::new(Duration::ZERO),
            next_handle: AtomicU64::new(1),
            next_connection: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
            reads: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            config_reads: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl Inner {
    fn check_online(&self, device: &str) -> Result<(), DeviceError> {
        if self.offline.lock().contains(device) {
            return Err(DeviceError::unreachable(device, "device is offline"));
        }
        Ok(())
    }

    fn attribute(&self, key: &AttributeKey) -> Result<MemoryAttribute, DeviceError> {
        self.attributes
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| DeviceError::attribute_not_found(key.as_str()))
    }

    fn sinks(&self, key: &AttributeKey) -> Vec<EventSink> {
        self.registrations
            .lock()
            .values()
            .filter(|registration| &registration.key == key)
            .map(|registration| registration.sink.clone())
            .collect()
    }
}

/// A connector to simulated in-memory devices.
///
/// Clones share the same devices, so a test can keep one clone to drive
/// values while the gateway owns another.
///
/// # Examples
///
/// ```ignore
/// use attrgate::{AttributeKey, protocol::MemoryConnector};
///
/// let devices = MemoryConnector::new();
/// let temp: AttributeKey = "dev1/temp".parse()?;
/// devices.insert(&temp, 21.5);
///
/// // Pushes a CHANGE event to every registered listener
/// devices.set_value(&temp, 22.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Inner>,
}

impl MemoryConnector {
    /// Creates a connector with no devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute, or replaces it, without notifying listeners.
    pub fn insert(&self, key: &AttributeKey, value: impl Into<Value>) {
        self.inner.attributes.lock().insert(
            key.clone(),
            MemoryAttribute {
                value: AttributeValue::new(value),
                config: AttributeConfig::default(),
            },
        );
    }

    /// Removes an attribute.
    pub fn remove(&self, key: &AttributeKey) {
        self.inner.attributes.lock().remove(key);
    }

    /// Changes an attribute's value and pushes it to registered listeners.
    pub fn set_value(&self, key: &AttributeKey, value: impl Into<Value>) {
        let value = AttributeValue::new(value);
        self.inner
            .attributes
            .lock()
            .entry(key.clone())
            .and_modify(|attribute| attribute.value = value.clone())
            .or_insert_with(|| MemoryAttribute {
                value: value.clone(),
                config: AttributeConfig::default(),
            });

        for sink in self.inner.sinks(key) {
            sink.change(value.clone());
        }
    }

    /// Changes an attribute's metadata and pushes it to registered listeners.
    pub fn set_config(&self, key: &AttributeKey, config: AttributeConfig) {
        if let Some(attribute) = self.inner.attributes.lock().get_mut(key) {
            attribute.config = config.clone();
        }
        for sink in self.inner.sinks(key) {
            sink.config(config.clone());
        }
    }

    /// Pushes an error event to registered listeners.
    pub fn push_error(&self, key: &AttributeKey, error: &DeviceError) {
        for sink in self.inner.sinks(key) {
            sink.error(error);
        }
    }

    /// Takes a device offline or brings it back.
    ///
    /// Every call on an offline device fails with `Unreachable`.
    pub fn set_online(&self, device: &str, online: bool) {
        let mut offline = self.inner.offline.lock();
        if online {
            offline.remove(device);
        } else {
            offline.insert(device.to_string());
        }
    }

    /// Enables or disables push registrations.
    ///
    /// When disabled, `register_listener` fails with `Unsupported`.
    pub fn set_push_enabled(&self, enabled: bool) {
        self.inner.push_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Makes every read take `delay` before completing.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.inner.read_delay.lock() = delay;
    }

    /// Makes every connection attempt take `delay` before completing.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Returns the number of connections opened.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Returns the number of reads issued for `key`.
    #[must_use]
    pub fn read_count(&self, key: &AttributeKey) -> usize {
        self.inner.reads.lock().get(key).copied().unwrap_or(0)
    }

    /// Returns the number of writes issued.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    /// Returns the number of metadata reads issued.
    #[must_use]
    pub fn config_read_count(&self) -> usize {
        self.inner.config_reads.load(Ordering::SeqCst)
    }

    /// Returns the number of live push registrations for `key`.
    #[must_use]
    pub fn registration_count(&self, key: &AttributeKey) -> usize {
        self.inner
            .registrations
            .lock()
            .values()
            .filter(|registration| &registration.key == key)
            .count()
    }

    /// Returns the number of registrations released.
    #[must_use]
    pub fn release_count(&self) -> usize {
        self.inner.releases.load(Ordering::SeqCst)
    }

    /// Returns the number of handles closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

impl DeviceConnector for MemoryConnector {
    type Handle = MemoryHandle;

    async fn connect(&self, device: &str) -> Result<MemoryHandle, DeviceError> {
        let delay = *self.inner.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.inner.check_online(device)?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryHandle {
            id: self.inner.next_connection.fetch_add(1, Ordering::SeqCst),
            device: device.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }
}

/// A handle to one simulated device.
///
/// Closing a handle drops every push registration made through it.
#[derive(Debug)]
pub struct MemoryHandle {
    id: u64,
    device: String,
    inner: Arc<Inner>,
}

impl MemoryHandle {
    fn key(&self, attribute: &str) -> Result<AttributeKey, DeviceError> {
        AttributeKey::from_parts(&self.device, attribute)
            .map_err(|_| DeviceError::attribute_not_found(format!("{}/{attribute}", self.device)))
    }
}

impl DeviceHandle for MemoryHandle {
    async fn read_attribute(&self, attribute: &str) -> Result<AttributeValue, DeviceError> {
        let key = self.key(attribute)?;
        *self.inner.reads.lock().entry(key.clone()).or_default() += 1;

        let delay = *self.inner.read_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.inner.check_online(&self.device)?;
        Ok(self.inner.attribute(&key)?.value)
    }

    async fn write_attribute(&self, attribute: &str, value: Value) -> Result<(), DeviceError> {
        let key = self.key(attribute)?;
        self.inner.check_online(&self.device)?;
        self.inner.writes.fetch_add(1, Ordering::SeqCst);

        let written = AttributeValue::new(value.clone()).with_w_value(value);
        {
            let mut attributes = self.inner.attributes.lock();
            let entry = attributes
                .get_mut(&key)
                .ok_or_else(|| DeviceError::attribute_not_found(key.as_str()))?;
            entry.value = written.clone();
        }

        for sink in self.inner.sinks(&key) {
            sink.change(written.clone());
        }
        Ok(())
    }

    async fn attribute_config(&self, attribute: &str) -> Result<AttributeConfig, DeviceError> {
        let key = self.key(attribute)?;
        self.inner.check_online(&self.device)?;
        self.inner.config_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.attribute(&key)?.config)
    }

    async fn register_listener(
        &self,
        attribute: &str,
        sink: EventSink,
    ) -> Result<ListenerHandle, DeviceError> {
        let key = self.key(attribute)?;
        self.inner.check_online(&self.device)?;
        if !self.inner.push_enabled.load(Ordering::SeqCst) {
            return Err(DeviceError::unsupported(key.as_str()));
        }
        let current = self.inner.attribute(&key)?;

        let id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        self.inner.registrations.lock().insert(
            id,
            Registration {
                owner: self.id,
                key,
                sink: sink.clone(),
            },
        );

        // Like a real device, announce the current state on registration.
        sink.config(current.config);
        sink.change(current.value);
        Ok(ListenerHandle::new(id))
    }

    fn release(&self, handle: ListenerHandle) {
        if self.inner.registrations.lock().remove(&handle.value()).is_some() {
            self.inner.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.inner
            .registrations
            .lock()
            .retain(|_, registration| registration.owner != self.id);
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}
