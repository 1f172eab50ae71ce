// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the gateway core.
//!
//! This module provides the error hierarchy used across the crate: device
//! I/O failures, delivery signals, value validation, and configuration.

use thiserror::Error;

use crate::types::SubscriberId;

/// The main error type for this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A device operation failed.
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Error occurred during value validation.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// The gateway configuration is invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Delivery to a subscriber failed.
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// No subscriber with this ID is connected.
    #[error("subscriber {0} not found")]
    SubscriberNotFound(SubscriberId),

    /// The subscriber has already been disconnected.
    #[error("subscriber {0} is closed")]
    SubscriberClosed(SubscriberId),
}

/// Errors reported by the device I/O collaborator.
///
/// The variants follow the gateway's failure taxonomy: `Unreachable` is
/// transient and retried by polling listeners, `AttributeNotFound` is
/// permanent for the key, and `Protocol` carries lower-level failures
/// verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not be reached.
    #[error("[{device}] device unreachable: {reason}")]
    Unreachable {
        /// The device that could not be reached.
        device: String,
        /// Description reported by the transport.
        reason: String,
    },

    /// The device does not expose the requested attribute.
    #[error("attribute not found: {key}")]
    AttributeNotFound {
        /// The attribute key that was requested.
        key: String,
    },

    /// A lower-level protocol failure.
    #[error("[{reason}] {description}")]
    Protocol {
        /// Short machine-readable reason.
        reason: String,
        /// Human-readable description.
        description: String,
    },

    /// The attribute does not support push notifications.
    #[error("push events not supported for {key}")]
    Unsupported {
        /// The attribute key that was requested.
        key: String,
    },
}

impl DeviceError {
    /// Creates an `Unreachable` error.
    #[must_use]
    pub fn unreachable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unreachable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `AttributeNotFound` error.
    #[must_use]
    pub fn attribute_not_found(key: impl Into<String>) -> Self {
        Self::AttributeNotFound { key: key.into() }
    }

    /// Creates a `Protocol` error.
    #[must_use]
    pub fn protocol(reason: impl Into<String>, description: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            description: description.into(),
        }
    }

    /// Creates an `Unsupported` error.
    #[must_use]
    pub fn unsupported(key: impl Into<String>) -> Self {
        Self::Unsupported { key: key.into() }
    }

    /// Returns `true` if retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Protocol { .. })
    }
}

/// Internal delivery signals.
///
/// These never describe a device failure; they drive the drop-or-close
/// policy of the delivery loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound channel was full and the batch was dropped.
    #[error("backpressure exceeded for {subscriber} ({consecutive} consecutive drops)")]
    BackpressureExceeded {
        /// The slow subscriber.
        subscriber: SubscriberId,
        /// Number of consecutive batches dropped so far.
        consecutive: u32,
    },

    /// The client side of the outbound channel is gone.
    #[error("outbound channel closed")]
    ChannelClosed,
}

/// Errors related to value validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// An attribute key is not of the form `device/attribute`.
    #[error("invalid attribute key: {0:?}")]
    InvalidAttributeKey(String),

    /// Only booleans, numbers and strings can be written.
    #[error("cannot write non-scalar value: {0}")]
    NotScalar(String),
}

/// Errors related to the gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A setting has an unusable value.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// The offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
