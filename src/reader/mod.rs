// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coalesced attribute reads.
//!
//! [`AttributeReader`] routes every read through a [`SingleFlight`], so any
//! number of concurrent readers of one attribute (queries and polling
//! listeners alike) cost a single device round trip.

mod single_flight;

pub use single_flight::SingleFlight;

use std::sync::Arc;

use crate::error::DeviceError;
use crate::protocol::{DeviceConnector, DeviceHandle, HandlePool};
use crate::types::{AttributeKey, AttributeValue};

/// Reads attribute values through the handle pool, one device call per
/// key at a time.
pub struct AttributeReader<C: DeviceConnector> {
    pool: Arc<HandlePool<C>>,
    flights: SingleFlight<AttributeKey, AttributeValue, DeviceError>,
}

impl<C: DeviceConnector> AttributeReader<C> {
    /// Creates a reader over a shared pool.
    #[must_use]
    pub fn new(pool: Arc<HandlePool<C>>) -> Self {
        Self {
            pool,
            flights: SingleFlight::new(),
        }
    }

    /// Reads the current value of an attribute.
    ///
    /// If a read for the same key is already in progress, waits for it and
    /// returns its result instead of issuing another device call.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable`, `AttributeNotFound` or `Protocol`; all callers
    /// sharing the read receive the same error.
    pub async fn read(&self, key: &AttributeKey) -> Result<AttributeValue, DeviceError> {
        let pool = Arc::clone(&self.pool);
        let target = key.clone();
        self.flights
            .run(key.clone(), move || async move {
                tracing::trace!(key = %target, "Reading attribute from device");
                let handle = pool.acquire(target.device()).await?;
                handle.read_attribute(target.attribute()).await
            })
            .await
    }

    /// Returns the pool this reader acquires handles from.
    #[must_use]
    pub fn pool(&self) -> &Arc<HandlePool<C>> {
        &self.pool
    }

    /// Returns the number of reads currently waiting on a device.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.in_flight()
    }
}

impl<C: DeviceConnector> std::fmt::Debug for AttributeReader<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeReader")
            .field("flights", &self.flights)
            .finish_non_exhaustive()
    }
}
