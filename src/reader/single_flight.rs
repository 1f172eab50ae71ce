// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyed request coalescing.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, WeakShared};
use parking_lot::Mutex;

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

/// An operation in progress for one key.
struct InFlight<V, E> {
    id: u64,
    future: WeakShared<BoxFuture<'static, Result<V, E>>>,
}

type FlightMap<K, V, E> = Mutex<HashMap<K, InFlight<V, E>>>;

/// Removes its flight from the map when the operation finishes or is
/// dropped by every waiter.
struct FlightGuard<K: Eq + Hash, V, E> {
    flights: Weak<FlightMap<K, V, E>>,
    key: Option<K>,
    id: u64,
}

impl<K: Eq + Hash, V, E> Drop for FlightGuard<K, V, E> {
    fn drop(&mut self) {
        let (Some(flights), Some(key)) = (self.flights.upgrade(), self.key.take()) else {
            return;
        };
        let mut flights = flights.lock();
        if flights.get(&key).is_some_and(|flight| flight.id == self.id) {
            flights.remove(&key);
        }
    }
}

/// Coalesces concurrent operations on the same key into one.
///
/// The first caller for a key starts the operation; callers arriving while
/// it is in progress wait for the same result, success or failure. The
/// flight is forgotten as soon as it completes, so the next call starts a
/// fresh operation: results are shared, never cached.
///
/// The map only holds a weak reference to the shared future. If every
/// waiter is cancelled the operation is dropped and its entry removed, so
/// a stale flight never blocks later calls.
///
/// # Examples
///
/// ```
/// use attrgate::reader::SingleFlight;
///
/// # async fn example() {
/// let flights: SingleFlight<String, u32, String> = SingleFlight::new();
///
/// let value = flights
///     .run("dev1/temp".to_string(), || async { Ok(21) })
///     .await
///     .unwrap();
/// assert_eq!(value, 21);
/// assert_eq!(flights.in_flight(), 0);
/// # }
/// ```
pub struct SingleFlight<K, V, E> {
    flights: Arc<FlightMap<K, V, E>>,
    next_id: AtomicU64,
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty coalescer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Runs `operation` for `key`, or joins the run already in progress.
    ///
    /// `operation` is only invoked when this call starts a new flight.
    ///
    /// # Errors
    ///
    /// Returns the operation's error; every waiter of the same flight gets
    /// the same error.
    pub async fn run<F, Fut>(&self, key: K, operation: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.join_or_start(key, operation).await
    }

    fn join_or_start<F, Fut>(&self, key: K, operation: F) -> SharedResult<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut flights = self.flights.lock();

        if let Some(existing) = flights.get(&key).and_then(|flight| flight.future.upgrade()) {
            tracing::trace!("Joining in-flight operation");
            return existing;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            flights: Arc::downgrade(&self.flights),
            key: Some(key.clone()),
            id,
        };
        let pending = operation();
        let shared = async move {
            let _guard = guard;
            pending.await
        }
        .boxed()
        .shared();

        if let Some(weak) = shared.downgrade() {
            flights.insert(key, InFlight { id, future: weak });
        }
        shared
    }

    /// Returns the number of operations currently in progress.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

impl<K, V, E> Default for SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> std::fmt::Debug for SingleFlight<K, V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.lock().len())
            .finish()
    }
}
