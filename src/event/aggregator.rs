// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Latest-value-wins event buffer.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use super::{EventBatch, EventKind, EventRecord};
use crate::types::AttributeKey;

/// Buffers events for one subscriber between delivery ticks.
///
/// Only the most recent record per (kind, attribute) is kept: a newer
/// CHANGE for `dev1/temp` replaces an unflushed older one, while a CONFIG
/// for the same attribute or a CHANGE for another attribute is kept
/// alongside it. Under high event rates a subscriber therefore sees the
/// latest state per attribute on each tick, not every intermediate value.
///
/// [`take`](Self::take) swaps the buffer out atomically, so events pushed
/// concurrently with a flush land either in the returned batch or in the
/// next one, never in neither.
///
/// # Examples
///
/// ```
/// use attrgate::event::{EventAggregator, EventRecord};
/// use attrgate::types::{AttributeKey, AttributeValue};
///
/// let key = AttributeKey::new("dev1/temp").unwrap();
/// let aggregator = EventAggregator::new();
///
/// aggregator.put(EventRecord::change(key.clone(), AttributeValue::new(1)));
/// aggregator.put(EventRecord::change(key.clone(), AttributeValue::new(2)));
///
/// let batch = aggregator.take();
/// assert_eq!(batch.len(), 1);
/// assert!(aggregator.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct EventAggregator {
    pending: Mutex<BTreeMap<(EventKind, AttributeKey), EventRecord>>,
}

impl EventAggregator {
    /// Creates an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record, replacing any unflushed record of the same kind for
    /// the same attribute.
    pub fn put(&self, record: EventRecord) {
        let slot = (record.kind(), record.key.clone());
        self.pending.lock().insert(slot, record);
    }

    /// Removes and returns everything accumulated since the last call.
    #[must_use]
    pub fn take(&self) -> EventBatch {
        let pending = std::mem::take(&mut *self.pending.lock());
        EventBatch::new(pending.into_values().collect())
    }

    /// Drops unflushed records for an attribute.
    pub fn discard(&self, key: &AttributeKey) {
        self.pending.lock().retain(|(_, k), _| k != key);
    }

    /// Returns the number of unflushed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if nothing is waiting to be flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
