// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device-side listeners and the sinks devices push events into.
//!
//! There is at most one [`Listener`] per attribute. It is fed either by the
//! device itself through an [`EventSink`] (push mode) or by a background
//! task that reads the attribute at a fixed interval (poll mode). In both
//! modes events fan out synchronously into every member subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::Subscriber;
use crate::config::GatewayConfig;
use crate::error::DeviceError;
use crate::event::{EventPayload, EventRecord};
use crate::protocol::{DeviceConnector, DeviceHandle, ListenerHandle};
use crate::reader::AttributeReader;
use crate::types::{AttributeConfig, AttributeKey, AttributeValue, SubscriberId};

/// How a listener receives events from its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerMode {
    /// The device pushes events through an [`EventSink`].
    Push,
    /// A background task polls the attribute.
    Poll,
}

impl std::fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Poll => write!(f, "poll"),
        }
    }
}

/// Polling parameters, taken from [`GatewayConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollSettings {
    pub interval: Duration,
    pub backoff: Duration,
    pub max_failures: u32,
}

impl From<&GatewayConfig> for PollSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            interval: config.poll_interval,
            backoff: config.poll_backoff,
            max_failures: config.max_poll_failures.max(1),
        }
    }
}

// ============================================================================
// Shared listener state
// ============================================================================

#[derive(Debug, Default)]
struct LastSeen {
    change: Option<EventRecord>,
    config: Option<EventRecord>,
}

/// State shared between a listener, its sinks, and its poll task.
#[derive(Debug)]
pub(crate) struct ListenerState {
    key: AttributeKey,
    active: AtomicBool,
    members: RwLock<HashMap<SubscriberId, Weak<Subscriber>>>,
    last: Mutex<LastSeen>,
}

impl ListenerState {
    fn new(key: AttributeKey) -> Self {
        Self {
            key,
            active: AtomicBool::new(true),
            members: RwLock::new(HashMap::new()),
            last: Mutex::new(LastSeen::default()),
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Fans an event out to every member.
    fn publish(&self, record: EventRecord) {
        if !self.is_active() {
            return;
        }

        {
            let mut last = self.last.lock();
            match &record.payload {
                EventPayload::Change(_) => last.change = Some(record.clone()),
                EventPayload::Config(_) => last.config = Some(record.clone()),
                EventPayload::Error(_) => {}
            }
        }

        let members = self.members.read();
        tracing::trace!(key = %self.key, kind = %record.kind(), members = members.len(), "Publishing event");
        for member in members.values() {
            if let Some(subscriber) = member.upgrade() {
                subscriber.push(record.clone());
            }
        }
    }

    /// Adds a member and primes it with the latest known value and config.
    ///
    /// Returns `false` if it was already a member.
    fn join(&self, subscriber: &Arc<Subscriber>) -> bool {
        let mut members = self.members.write();
        if members.contains_key(&subscriber.id()) {
            return false;
        }
        members.insert(subscriber.id(), Arc::downgrade(subscriber));

        // Priming under the member lock keeps it ordered before any
        // event published after the join.
        let last = self.last.lock();
        if let Some(config) = &last.config {
            subscriber.push(config.clone());
        }
        if let Some(change) = &last.change {
            subscriber.push(change.clone());
        }
        true
    }

    fn leave(&self, id: SubscriberId) -> bool {
        self.members.write().remove(&id).is_some()
    }

    fn member_count(&self) -> usize {
        self.members.read().len()
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
        self.members.write().clear();
    }
}

// ============================================================================
// EventSink
// ============================================================================

/// Where a device delivers push events for one registered attribute.
///
/// The sink stays valid for as long as the registration does. Once the
/// gateway releases the registration, every call becomes a no-op and
/// [`is_active`](Self::is_active) returns `false`.
#[derive(Debug, Clone)]
pub struct EventSink {
    key: AttributeKey,
    state: Weak<ListenerState>,
}

impl EventSink {
    fn new(state: &Arc<ListenerState>) -> Self {
        Self {
            key: state.key.clone(),
            state: Arc::downgrade(state),
        }
    }

    /// A sink with no listener behind it; every event is dropped.
    #[cfg(test)]
    pub(crate) fn detached(key: AttributeKey) -> Self {
        Self {
            key,
            state: Weak::new(),
        }
    }

    /// Returns the attribute this sink is registered for.
    #[must_use]
    pub fn key(&self) -> &AttributeKey {
        &self.key
    }

    /// Returns `false` once the registration has been released.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.upgrade().is_some_and(|state| state.is_active())
    }

    /// Delivers an event payload.
    pub fn push(&self, payload: EventPayload) {
        if let Some(state) = self.state.upgrade() {
            state.publish(EventRecord::new(self.key.clone(), payload));
        }
    }

    /// Delivers a new attribute value.
    pub fn change(&self, value: AttributeValue) {
        self.push(EventPayload::Change(value));
    }

    /// Delivers new attribute metadata.
    pub fn config(&self, config: AttributeConfig) {
        self.push(EventPayload::Config(config.normalized()));
    }

    /// Delivers a device failure.
    pub fn error(&self, error: &DeviceError) {
        self.push(EventPayload::Error(error.to_string()));
    }
}

// ============================================================================
// Listener
// ============================================================================

enum Source<H> {
    Push {
        device: Arc<H>,
        handle: ListenerHandle,
    },
    Poll {
        task: JoinHandle<()>,
    },
}

/// The single device-side listener of one attribute.
///
/// Dropping a listener tears it down: push registrations are released on
/// the device and poll tasks are aborted.
pub(crate) struct Listener<H: DeviceHandle> {
    state: Arc<ListenerState>,
    source: Option<Source<H>>,
}

impl<H: DeviceHandle> Listener<H> {
    /// Starts listening on `key`.
    ///
    /// Tries to register a push listener on the device first and falls back
    /// to polling when the device cannot be reached or refuses.
    pub(crate) async fn start<C>(
        key: &AttributeKey,
        reader: &Arc<AttributeReader<C>>,
        settings: PollSettings,
    ) -> Self
    where
        C: DeviceConnector<Handle = H>,
    {
        let state = Arc::new(ListenerState::new(key.clone()));

        let source = match register_push(key, reader, &state).await {
            Ok((device, handle)) => {
                tracing::debug!(%key, handle = handle.value(), "Registered push listener");
                Source::Push { device, handle }
            }
            Err(err) => {
                tracing::debug!(%key, error = %err, "Push registration failed, polling instead");
                let task = tokio::spawn(poll_loop(
                    key.clone(),
                    Arc::downgrade(&state),
                    Arc::clone(reader),
                    settings,
                ));
                Source::Poll { task }
            }
        };

        Self {
            state,
            source: Some(source),
        }
    }

    pub(crate) fn mode(&self) -> ListenerMode {
        match self.source {
            Some(Source::Poll { .. }) => ListenerMode::Poll,
            _ => ListenerMode::Push,
        }
    }

    pub(crate) fn join(&self, subscriber: &Arc<Subscriber>) -> bool {
        self.state.join(subscriber)
    }

    pub(crate) fn leave(&self, id: SubscriberId) -> bool {
        self.state.leave(id)
    }

    pub(crate) fn member_count(&self) -> usize {
        self.state.member_count()
    }

    fn shutdown(&mut self) {
        self.state.deactivate();
        match self.source.take() {
            Some(Source::Push { device, handle }) => {
                tracing::debug!(key = %self.state.key, handle = handle.value(), "Releasing push listener");
                device.release(handle);
            }
            Some(Source::Poll { task }) => {
                tracing::debug!(key = %self.state.key, "Stopping poll listener");
                task.abort();
            }
            None => {}
        }
    }
}

impl<H: DeviceHandle> Drop for Listener<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: DeviceHandle> std::fmt::Debug for Listener<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("key", &self.state.key)
            .field("mode", &self.mode())
            .field("members", &self.member_count())
            .finish_non_exhaustive()
    }
}

async fn register_push<C: DeviceConnector>(
    key: &AttributeKey,
    reader: &AttributeReader<C>,
    state: &Arc<ListenerState>,
) -> Result<(Arc<C::Handle>, ListenerHandle), DeviceError> {
    let device = reader.pool().acquire(key.device()).await?;
    let handle = device
        .register_listener(key.attribute(), EventSink::new(state))
        .await?;
    Ok((device, handle))
}

// ============================================================================
// Polling
// ============================================================================

/// Reads `key` until the listener goes away.
///
/// Emits CHANGE whenever the reading differs from the previous one. A run
/// of `max_failures` transient errors emits a single ERROR; the next good
/// reading is then emitted even if unchanged. `AttributeNotFound` emits
/// ERROR and ends the loop.
async fn poll_loop<C: DeviceConnector>(
    key: AttributeKey,
    state: Weak<ListenerState>,
    reader: Arc<AttributeReader<C>>,
    settings: PollSettings,
) {
    let mut last: Option<AttributeValue> = None;
    let mut failures: u32 = 0;

    loop {
        let result = reader.read(&key).await;

        let Some(listener) = state.upgrade().filter(|listener| listener.is_active()) else {
            break;
        };

        let delay = match result {
            Ok(value) => {
                if failures > 0 {
                    tracing::debug!(%key, failures, "Attribute readable again");
                    failures = 0;
                }
                if last.as_ref().is_none_or(|prev| !prev.same_reading(&value)) {
                    listener.publish(EventRecord::change(key.clone(), value.clone()));
                    last = Some(value);
                }
                settings.interval
            }
            Err(err @ DeviceError::AttributeNotFound { .. }) => {
                tracing::warn!(%key, error = %err, "Attribute not found, stopping poll");
                listener.publish(EventRecord::device_error(key.clone(), &err));
                break;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                if failures == settings.max_failures {
                    tracing::warn!(%key, failures, error = %err, "Polling keeps failing");
                    listener.publish(EventRecord::device_error(key.clone(), &err));
                    last = None;
                } else {
                    tracing::debug!(%key, failures, error = %err, "Poll failed, backing off");
                }
                settings.backoff
            }
        };

        drop(listener);
        tokio::time::sleep(delay).await;
    }
}
