// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute readings and metadata.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Quality flag attached to every reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    /// The value is valid.
    #[default]
    Valid,
    /// The value could not be read correctly.
    Invalid,
    /// The value is outside its alarm limits.
    Alarm,
    /// The value is being changed.
    Changing,
    /// The value is outside its warning limits.
    Warning,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "ATTR_VALID",
            Self::Invalid => "ATTR_INVALID",
            Self::Alarm => "ATTR_ALARM",
            Self::Changing => "ATTR_CHANGING",
            Self::Warning => "ATTR_WARNING",
        };
        f.write_str(name)
    }
}

/// A single reading of an attribute.
///
/// `value` and `w_value` are untyped JSON values: scalars for scalar
/// attributes, arrays for spectrum and image attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    /// The read value.
    pub value: Value,
    /// The last written (set point) value, if the attribute is writable.
    pub w_value: Value,
    /// Quality of the reading.
    pub quality: Quality,
    /// When the device took the reading.
    pub time: DateTime<Utc>,
}

impl AttributeValue {
    /// Creates a valid reading timestamped now.
    #[must_use]
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            w_value: Value::Null,
            quality: Quality::Valid,
            time: Utc::now(),
        }
    }

    /// Sets the write value.
    #[must_use]
    pub fn with_w_value(mut self, w_value: impl Into<Value>) -> Self {
        self.w_value = w_value.into();
        self
    }

    /// Sets the quality flag.
    #[must_use]
    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    /// Sets the reading time.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Returns `true` if `other` carries the same value, set point and
    /// quality, ignoring the timestamp.
    #[must_use]
    pub fn same_reading(&self, other: &Self) -> bool {
        self.value == other.value && self.w_value == other.w_value && self.quality == other.quality
    }
}

/// Shape of an attribute's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataFormat {
    /// A single value.
    #[default]
    Scalar,
    /// A one-dimensional array.
    Spectrum,
    /// A two-dimensional array.
    Image,
}

/// Descriptive metadata for an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeConfig {
    /// Free-text description.
    pub description: String,
    /// Display label.
    pub label: String,
    /// Engineering unit, empty if the attribute has none.
    pub unit: String,
    /// Display format string (e.g. `%6.2f`).
    pub format: String,
    /// Shape of the data.
    pub data_format: DataFormat,
    /// Name of the underlying data type (e.g. `DevDouble`).
    pub data_type: String,
}

impl AttributeConfig {
    /// Placeholder some devices report instead of an empty unit.
    pub const NO_UNIT: &'static str = "No unit";

    /// Returns the config with placeholder values normalized.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.unit == Self::NO_UNIT {
            self.unit.clear();
        }
        self
    }
}
