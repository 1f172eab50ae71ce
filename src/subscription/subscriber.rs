// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-client subscription state.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::event::{EventAggregator, EventBatch, EventRecord};
use crate::types::{AttributeKey, SubscriberId};

/// One client's interest in a set of attributes.
///
/// A subscriber owns the [`EventAggregator`] its delivery loop drains, and
/// remembers which attributes it is subscribed to so that a disconnect can
/// detach it from every listener. Listeners only hold weak references to
/// subscribers.
///
/// Once closed, a subscriber ignores new events and cannot be closed again.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    aggregator: EventAggregator,
    keys: Mutex<BTreeSet<AttributeKey>>,
    closed: watch::Sender<bool>,
}

impl Subscriber {
    /// Creates an open subscriber with no subscriptions.
    #[must_use]
    pub fn new(id: SubscriberId) -> Self {
        Self {
            id,
            aggregator: EventAggregator::new(),
            keys: Mutex::new(BTreeSet::new()),
            closed: watch::Sender::new(false),
        }
    }

    /// Returns the subscriber's ID.
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns the attributes this subscriber is subscribed to.
    #[must_use]
    pub fn keys(&self) -> Vec<AttributeKey> {
        self.keys.lock().iter().cloned().collect()
    }

    /// Returns `true` if subscribed to `key`.
    #[must_use]
    pub fn is_subscribed(&self, key: &AttributeKey) -> bool {
        self.keys.lock().contains(key)
    }

    /// Buffers an event for the next delivery tick.
    pub(crate) fn push(&self, record: EventRecord) {
        if !self.is_closed() {
            self.aggregator.put(record);
        }
    }

    /// Takes everything buffered since the last drain.
    #[must_use]
    pub fn drain(&self) -> EventBatch {
        self.aggregator.take()
    }

    /// Returns the number of buffered events.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.aggregator.len()
    }

    pub(crate) fn add_key(&self, key: &AttributeKey) -> bool {
        self.keys.lock().insert(key.clone())
    }

    pub(crate) fn remove_key(&self, key: &AttributeKey) -> bool {
        let removed = self.keys.lock().remove(key);
        if removed {
            self.aggregator.discard(key);
        }
        removed
    }

    pub(crate) fn first_key(&self) -> Option<AttributeKey> {
        self.keys.lock().first().cloned()
    }

    /// Marks the subscriber closed.
    ///
    /// Returns `true` for the call that actually closed it.
    pub(crate) fn close(&self) -> bool {
        let closed = self.closed.send_if_modified(|closed| !std::mem::replace(closed, true));
        if closed {
            // Buffered events will never be delivered.
            let _ = self.aggregator.take();
        }
        closed
    }

    /// Returns `true` once the subscriber has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the subscriber is closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
