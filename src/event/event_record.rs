// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Event records and delivery batches.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeviceError;
use crate::types::{AttributeConfig, AttributeKey, AttributeValue};

/// Kind of an attribute event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// The attribute value changed.
    Change,
    /// The attribute configuration changed.
    Config,
    /// The attribute could not be observed.
    Error,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Change => "CHANGE",
            Self::Config => "CONFIG",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Payload of an event, tagged with its kind.
///
/// Serializes as `{"type": "CHANGE", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// A new reading.
    Change(AttributeValue),
    /// New attribute metadata.
    Config(AttributeConfig),
    /// A description of why the attribute could not be observed.
    Error(String),
}

impl EventPayload {
    /// Returns the kind of this payload.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Change(_) => EventKind::Change,
            Self::Config(_) => EventKind::Config,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// An immutable event observed on one attribute.
///
/// # Examples
///
/// ```
/// use attrgate::event::{EventKind, EventRecord};
/// use attrgate::types::{AttributeKey, AttributeValue};
///
/// let key = AttributeKey::new("dev1/temp").unwrap();
/// let record = EventRecord::change(key, AttributeValue::new(21.5));
/// assert_eq!(record.kind(), EventKind::Change);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The attribute the event belongs to.
    pub key: AttributeKey,
    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
    /// When the gateway received the event.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Creates a record timestamped now.
    #[must_use]
    pub fn new(key: AttributeKey, payload: EventPayload) -> Self {
        Self {
            key,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Creates a CHANGE record.
    #[must_use]
    pub fn change(key: AttributeKey, value: AttributeValue) -> Self {
        Self::new(key, EventPayload::Change(value))
    }

    /// Creates a CONFIG record. The config is normalized first.
    #[must_use]
    pub fn config(key: AttributeKey, config: AttributeConfig) -> Self {
        Self::new(key, EventPayload::Config(config.normalized()))
    }

    /// Creates an ERROR record.
    #[must_use]
    pub fn error(key: AttributeKey, message: impl Into<String>) -> Self {
        Self::new(key, EventPayload::Error(message.into()))
    }

    /// Creates an ERROR record describing a device failure.
    #[must_use]
    pub fn device_error(key: AttributeKey, error: &DeviceError) -> Self {
        Self::error(key, error.to_string())
    }

    /// Returns the kind of this record.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Returns the reading carried by a CHANGE record.
    #[must_use]
    pub fn value(&self) -> Option<&AttributeValue> {
        match &self.payload {
            EventPayload::Change(value) => Some(value),
            _ => None,
        }
    }
}

/// The events flushed for one subscriber on one delivery tick.
///
/// A batch holds at most one record per (kind, attribute), ordered by kind
/// and then by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventBatch {
    events: Vec<EventRecord>,
}

impl EventBatch {
    /// Creates a batch from already de-duplicated records.
    #[must_use]
    pub fn new(events: Vec<EventRecord>) -> Self {
        Self { events }
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the batch has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the record for a kind and attribute, if present.
    #[must_use]
    pub fn get(&self, kind: EventKind, key: &AttributeKey) -> Option<&EventRecord> {
        self.events
            .iter()
            .find(|record| record.kind() == kind && &record.key == key)
    }

    /// Iterates over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, EventRecord> {
        self.events.iter()
    }

    /// Returns the records.
    #[must_use]
    pub fn into_events(self) -> Vec<EventRecord> {
        self.events
    }
}

impl IntoIterator for EventBatch {
    type Item = EventRecord;
    type IntoIter = std::vec::IntoIter<EventRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a EventRecord;
    type IntoIter = std::slice::Iter<'a, EventRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AttributeKey {
        AttributeKey::new(s).unwrap()
    }

    #[test]
    fn payload_kind_matches_variant() {
        assert_eq!(
            EventPayload::Change(AttributeValue::new(1)).kind(),
            EventKind::Change
        );
        assert_eq!(
            EventPayload::Config(AttributeConfig::default()).kind(),
            EventKind::Config
        );
        assert_eq!(EventPayload::Error("x".into()).kind(), EventKind::Error);
    }

    #[test]
    fn device_error_record_uses_reason_format() {
        let err = DeviceError::protocol("API_DeviceTimedOut", "Timeout (3000 mS) exceeded");
        let record = EventRecord::device_error(key("dev1/temp"), &err);
        assert_eq!(
            record.payload,
            EventPayload::Error("[API_DeviceTimedOut] Timeout (3000 mS) exceeded".into())
        );
    }

    #[test]
    fn record_serializes_with_type_and_data() {
        let record = EventRecord::error(key("dev1/temp"), "gone");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["key"], "dev1/temp");
        assert_eq!(json["type"], "ERROR");
        assert_eq!(json["data"], "gone");
    }

    #[test]
    fn config_record_is_normalized() {
        let config = AttributeConfig {
            unit: AttributeConfig::NO_UNIT.into(),
            ..AttributeConfig::default()
        };
        let record = EventRecord::config(key("dev1/temp"), config);
        let EventPayload::Config(config) = record.payload else {
            panic!("Expected CONFIG payload");
        };
        assert!(config.unit.is_empty());
    }

    #[test]
    fn batch_lookup_by_kind_and_key() {
        let batch = EventBatch::new(vec![
            EventRecord::change(key("dev1/temp"), AttributeValue::new(1)),
            EventRecord::error(key("dev1/temp"), "boom"),
        ]);
        assert_eq!(batch.len(), 2);
        assert!(batch.get(EventKind::Change, &key("dev1/temp")).is_some());
        assert!(batch.get(EventKind::Config, &key("dev1/temp")).is_none());
        assert!(batch.get(EventKind::Change, &key("dev2/temp")).is_none());
    }
}
