// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Value types shared across the gateway.
//!
//! # Types
//!
//! - [`AttributeKey`] - `device/attribute` key used by every map
//! - [`SubscriberId`] - Identifier of one connected client
//! - [`AttributeValue`] - A reading with its set point, quality and time
//! - [`AttributeConfig`] - Descriptive attribute metadata

mod attribute_key;
mod attribute_value;
mod subscriber_id;

pub use attribute_key::AttributeKey;
pub use attribute_value::{AttributeConfig, AttributeValue, DataFormat, Quality};
pub use subscriber_id::SubscriberId;
