// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Periodic delivery of buffered events to a client.
//!
//! Each connected client gets one [`DeliveryLoop`] task. On every tick it
//! drains the subscriber's aggregator and hands the batch to the client's
//! bounded outbound channel without waiting. A full channel drops the
//! batch; a client that stays full for too long is disconnected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;

use crate::config::GatewayConfig;
use crate::error::DeliveryError;
use crate::event::EventBatch;
use crate::protocol::DeviceConnector;
use crate::subscription::{Subscriber, SubscriptionRegistry};

/// Why a delivery loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryExit {
    /// The subscriber was disconnected elsewhere.
    Disconnected,
    /// The client dropped its receiver.
    ClientGone,
    /// Too many consecutive batches were dropped.
    Backpressure,
}

/// Drains one subscriber on a fixed interval.
pub struct DeliveryLoop<C: DeviceConnector> {
    subscriber: Arc<Subscriber>,
    registry: Arc<SubscriptionRegistry<C>>,
    outbound: mpsc::Sender<EventBatch>,
    interval: Duration,
    max_consecutive_drops: u32,
    consecutive_drops: u32,
}

impl<C: DeviceConnector> DeliveryLoop<C> {
    /// Creates a delivery loop for `subscriber`.
    #[must_use]
    pub fn new(
        subscriber: Arc<Subscriber>,
        registry: Arc<SubscriptionRegistry<C>>,
        outbound: mpsc::Sender<EventBatch>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            subscriber,
            registry,
            outbound,
            interval: config.delivery_interval,
            max_consecutive_drops: config.max_consecutive_drops.max(1),
            consecutive_drops: 0,
        }
    }

    /// Runs until the subscriber is disconnected, the client goes away, or
    /// backpressure persists.
    ///
    /// Always leaves the subscriber disconnected from the registry.
    pub async fn run(mut self) -> DeliveryExit {
        let id = self.subscriber.id();
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!(subscriber = %id, interval = ?self.interval, "Delivery loop started");

        let exit = loop {
            tokio::select! {
                () = self.subscriber.closed() => break DeliveryExit::Disconnected,
                () = self.outbound.closed() => break DeliveryExit::ClientGone,
                _ = ticker.tick() => {}
            }

            match self.flush() {
                Ok(()) => {}
                Err(DeliveryError::ChannelClosed) => break DeliveryExit::ClientGone,
                Err(err @ DeliveryError::BackpressureExceeded { consecutive, .. }) => {
                    if consecutive >= self.max_consecutive_drops {
                        tracing::warn!(subscriber = %id, error = %err, "Closing slow subscriber");
                        break DeliveryExit::Backpressure;
                    }
                    tracing::debug!(subscriber = %id, error = %err, "Dropped batch");
                }
            }
        };

        self.registry.disconnect(id).await;
        tracing::debug!(subscriber = %id, ?exit, "Delivery loop stopped");
        exit
    }

    /// Hands the pending batch to the client, if there is one.
    fn flush(&mut self) -> Result<(), DeliveryError> {
        let batch = self.subscriber.drain();
        if batch.is_empty() {
            return Ok(());
        }

        let count = batch.len();
        match self.outbound.try_send(batch) {
            Ok(()) => {
                tracing::trace!(subscriber = %self.subscriber.id(), events = count, "Delivered batch");
                self.consecutive_drops = 0;
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                self.consecutive_drops = self.consecutive_drops.saturating_add(1);
                Err(DeliveryError::BackpressureExceeded {
                    subscriber: self.subscriber.id(),
                    consecutive: self.consecutive_drops,
                })
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::ChannelClosed),
        }
    }
}

impl<C: DeviceConnector> std::fmt::Debug for DeliveryLoop<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryLoop")
            .field("subscriber", &self.subscriber.id())
            .field("interval", &self.interval)
            .field("consecutive_drops", &self.consecutive_drops)
            .finish_non_exhaustive()
    }
}
