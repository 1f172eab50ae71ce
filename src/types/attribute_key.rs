// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute key type.
//!
//! Every map in the gateway is keyed by an [`AttributeKey`]: the opaque
//! `device/attribute` string naming one attribute of one device.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValueError;

/// Identifies one attribute of one device.
///
/// The key is split on its *last* `/`, so device names may themselves
/// contain slashes (`sys/tg_test/1/ampli` names attribute `ampli` on device
/// `sys/tg_test/1`). Both halves must be non-empty.
///
/// Keys are immutable and cheap to clone.
///
/// # Examples
///
/// ```
/// use attrgate::types::AttributeKey;
///
/// let key = AttributeKey::new("sys/tg_test/1/ampli").unwrap();
/// assert_eq!(key.device(), "sys/tg_test/1");
/// assert_eq!(key.attribute(), "ampli");
///
/// assert!(AttributeKey::new("ampli").is_err());
/// assert!(AttributeKey::new("dev1/").is_err());
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeKey {
    full: Arc<str>,
    split: usize,
}

impl AttributeKey {
    /// Parses a `device/attribute` key.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::InvalidAttributeKey` if the key has no `/`,
    /// either side of the last `/` is empty, or the key starts or ends with
    /// whitespace.
    pub fn new(key: &str) -> Result<Self, ValueError> {
        if key.trim() != key {
            return Err(ValueError::InvalidAttributeKey(key.to_string()));
        }
        match key.rsplit_once('/') {
            Some((device, attribute)) if !device.is_empty() && !attribute.is_empty() => {
                Ok(Self {
                    full: Arc::from(key),
                    split: device.len(),
                })
            }
            _ => Err(ValueError::InvalidAttributeKey(key.to_string())),
        }
    }

    /// Builds a key from its two halves.
    ///
    /// # Errors
    ///
    /// Returns `ValueError::InvalidAttributeKey` if either half is empty or
    /// the attribute name contains a `/`.
    pub fn from_parts(device: &str, attribute: &str) -> Result<Self, ValueError> {
        if attribute.contains('/') {
            return Err(ValueError::InvalidAttributeKey(format!(
                "{device}/{attribute}"
            )));
        }
        Self::new(&format!("{device}/{attribute}"))
    }

    /// Returns the device part of the key.
    #[must_use]
    pub fn device(&self) -> &str {
        &self.full[..self.split]
    }

    /// Returns the attribute name.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.full[self.split + 1..]
    }

    /// Returns the full key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl fmt::Debug for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttributeKey({})", self.full)
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

impl FromStr for AttributeKey {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<&str> for AttributeKey {
    type Error = ValueError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for AttributeKey {
    fn as_ref(&self) -> &str {
        &self.full
    }
}

impl Serialize for AttributeKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full)
    }
}

impl<'de> Deserialize<'de> for AttributeKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}
