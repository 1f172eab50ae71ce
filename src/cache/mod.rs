// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Caching layers.
//!
//! [`TtlCache`] memoizes metadata lookups for a fixed lifetime. Device
//! handles are bounded separately by [`HandlePool`](crate::protocol::HandlePool).

mod ttl_cache;

pub use ttl_cache::TtlCache;
