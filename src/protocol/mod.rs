// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boundary to the device I/O collaborator.
//!
//! The gateway never talks to devices directly. An embedding application
//! supplies a [`DeviceConnector`] that opens [`DeviceHandle`]s; the handle
//! performs the actual reads, writes and event registrations.
//!
//! # Connection Pooling
//!
//! Opening a handle is expensive, so handles are kept in a bounded
//! [`HandlePool`] and shared by every operation on the same device.
//!
//! # Simulated Devices
//!
//! [`MemoryConnector`] implements both traits over in-memory state, for
//! tests and demos.

mod handle_pool;
mod memory;

pub use handle_pool::HandlePool;
pub use memory::{MemoryConnector, MemoryHandle};
pub use crate::subscription::EventSink;

use std::future::Future;

use serde_json::Value;

use crate::error::DeviceError;
use crate::types::{AttributeConfig, AttributeValue};

/// Opaque token for one device-side event registration.
///
/// Returned by [`DeviceHandle::register_listener`] and handed back to
/// [`DeviceHandle::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    /// Creates a handle with the given value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw handle value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

/// Opens connections to devices.
pub trait DeviceConnector: Send + Sync + 'static {
    /// The connection type produced by this connector.
    type Handle: DeviceHandle;

    /// Opens a connection to a device.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Unreachable` if the device cannot be contacted.
    fn connect(
        &self,
        device: &str,
    ) -> impl Future<Output = Result<Self::Handle, DeviceError>> + Send;
}

/// An open connection to one device.
///
/// Handles are shared between concurrent callers, so implementations must
/// tolerate overlapping calls.
pub trait DeviceHandle: Send + Sync + 'static {
    /// Reads the current value of an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable`, `AttributeNotFound` or `Protocol` depending on
    /// the failure.
    fn read_attribute(
        &self,
        attribute: &str,
    ) -> impl Future<Output = Result<AttributeValue, DeviceError>> + Send;

    /// Writes a new value to an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable`, `AttributeNotFound` or `Protocol` depending on
    /// the failure.
    fn write_attribute(
        &self,
        attribute: &str,
        value: Value,
    ) -> impl Future<Output = Result<(), DeviceError>> + Send;

    /// Reads the metadata of an attribute.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable`, `AttributeNotFound` or `Protocol` depending on
    /// the failure.
    fn attribute_config(
        &self,
        attribute: &str,
    ) -> impl Future<Output = Result<AttributeConfig, DeviceError>> + Send;

    /// Registers for push notifications on an attribute.
    ///
    /// The device must deliver events through `sink`, in emission order,
    /// until the returned handle is released.
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Unsupported` if the attribute cannot push
    /// events; the gateway then polls it instead.
    fn register_listener(
        &self,
        attribute: &str,
        sink: EventSink,
    ) -> impl Future<Output = Result<ListenerHandle, DeviceError>> + Send;

    /// Cancels a registration made by [`register_listener`](Self::register_listener).
    ///
    /// Called synchronously when the last subscriber of the attribute goes
    /// away.
    fn release(&self, handle: ListenerHandle);

    /// Releases the underlying connection.
    ///
    /// Called exactly once when the pool evicts the handle.
    fn close(&self) {}
}
