// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Subscriptions to live attributes.
//!
//! This module provides:
//!
//! - [`Subscriber`] - One client's buffered view of the attributes it watches
//! - [`SubscriptionRegistry`] - Maps attributes to subscribers and owns the
//!   single device-side listener of each attribute
//! - [`EventSink`] - Handed to devices so they can push events
//!
//! # Listener Lifecycle
//!
//! The first subscription to an attribute starts a listener, preferring
//! device push notifications and falling back to polling. The listener is
//! torn down as soon as the last subscriber leaves, whether by
//! unsubscribing or by disconnecting.

mod listener;
mod registry;
mod subscriber;

pub use listener::{EventSink, ListenerMode};
pub use registry::SubscriptionRegistry;
pub use subscriber::Subscriber;
