// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attribute events and per-subscriber buffering.
//!
//! Listeners turn device notifications and poll results into
//! [`EventRecord`]s. Each subscriber buffers them in an [`EventAggregator`]
//! that keeps only the latest record per (kind, attribute); the delivery
//! loop flushes it into an [`EventBatch`] on every tick.

mod aggregator;
mod event_record;

pub use aggregator::EventAggregator;
pub use event_record::{EventBatch, EventKind, EventPayload, EventRecord};
