// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pool of device handles.
//!
//! Every operation on a device goes through one shared handle. The pool
//! keeps at most `capacity` handles and closes the least recently used idle
//! one when a new device is requested at capacity. A handle still held
//! outside the pool, such as by a push listener, is never evicted.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{DeviceConnector, DeviceHandle};
use crate::error::DeviceError;

/// A pooled handle and the logical time it was last handed out.
struct PooledHandle<H> {
    handle: Arc<H>,
    last_used: u64,
}

/// Pool of device handles with least-recently-used eviction.
///
/// Handles are shared: [`acquire`](Self::acquire) returns an `Arc` and
/// callers must tolerate that other operations use the same handle
/// concurrently. Only idle handles, referenced by the pool alone, are
/// eviction candidates; if every handle is in use the pool temporarily
/// grows past its capacity. The internal map lock is only held for lookups and
/// inserts, never while a connection is being opened.
///
/// # Examples
///
/// ```ignore
/// use attrgate::protocol::HandlePool;
///
/// let pool = HandlePool::new(connector, 100);
///
/// // Opens a connection on first use
/// let handle = pool.acquire("sys/tg_test/1").await?;
///
/// // Later calls for the same device reuse it
/// let same = pool.acquire("sys/tg_test/1").await?;
/// ```
pub struct HandlePool<C: DeviceConnector> {
    connector: C,
    capacity: usize,
    handles: Mutex<HashMap<String, PooledHandle<C::Handle>>>,
    /// Logical clock ordering handle use, for LRU selection.
    clock: AtomicU64,
}

impl<C: DeviceConnector> HandlePool<C> {
    /// Creates an empty pool holding at most `capacity` handles.
    ///
    /// A capacity of zero is treated as one.
    #[must_use]
    pub fn new(connector: C, capacity: usize) -> Self {
        Self {
            connector,
            capacity: capacity.max(1),
            handles: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the handle for a device, opening one if needed.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if a new connection cannot be opened.
    /// A failed connection leaves the pool unchanged.
    pub async fn acquire(&self, device: &str) -> Result<Arc<C::Handle>, DeviceError> {
        {
            let mut handles = self.handles.lock();
            if let Some(pooled) = handles.get_mut(device) {
                pooled.last_used = self.tick();
                return Ok(Arc::clone(&pooled.handle));
            }
        }

        tracing::debug!(device, "Opening device handle");
        let fresh = Arc::new(self.connector.connect(device).await?);

        let mut evicted = Vec::new();
        let mut duplicate = None;
        let handle = {
            let mut handles = self.handles.lock();
            if let Some(pooled) = handles.get_mut(device) {
                // Another caller connected first; keep theirs.
                pooled.last_used = self.tick();
                duplicate = Some(fresh);
                Arc::clone(&pooled.handle)
            } else {
                while handles.len() >= self.capacity {
                    let oldest = handles
                        .iter()
                        .filter(|(_, pooled)| Arc::strong_count(&pooled.handle) == 1)
                        .min_by_key(|(_, pooled)| pooled.last_used)
                        .map(|(name, _)| name.clone());
                    let Some(name) = oldest else {
                        tracing::debug!(
                            device,
                            pooled = handles.len(),
                            capacity = self.capacity,
                            "All device handles in use, exceeding pool capacity"
                        );
                        break;
                    };
                    if let Some(pooled) = handles.remove(&name) {
                        evicted.push((name, pooled.handle));
                    }
                }
                handles.insert(
                    device.to_string(),
                    PooledHandle {
                        handle: Arc::clone(&fresh),
                        last_used: self.tick(),
                    },
                );
                fresh
            }
        };

        for (name, handle) in evicted {
            tracing::debug!(device = %name, "Evicting least recently used device handle");
            handle.close();
        }
        if let Some(handle) = duplicate {
            handle.close();
        }

        Ok(handle)
    }

    /// Removes and closes the handle for a device, even if it is in use.
    ///
    /// Returns `true` if a handle was pooled.
    pub fn evict(&self, device: &str) -> bool {
        let removed = self.handles.lock().remove(device);
        match removed {
            Some(pooled) => {
                pooled.handle.close();
                true
            }
            None => false,
        }
    }

    /// Closes and removes every pooled handle.
    pub fn clear(&self) {
        let drained: Vec<_> = self.handles.lock().drain().collect();
        for (_, pooled) in drained {
            pooled.handle.close();
        }
    }

    /// Returns `true` if a handle for the device is pooled.
    #[must_use]
    pub fn contains(&self, device: &str) -> bool {
        self.handles.lock().contains_key(device)
    }

    /// Returns the number of pooled handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns `true` if no handle is pooled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Returns the maximum number of pooled handles.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<C: DeviceConnector> std::fmt::Debug for HandlePool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlePool")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
