// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `attrgate` - Live-attribute subscriptions for device gateways.
//!
//! This library sits between many clients and a fleet of devices. Clients
//! read, write and subscribe to device attributes; the gateway makes sure
//! each attribute costs the devices as little as possible.
//!
//! # Supported Features
//!
//! - **Coalesced reads**: concurrent reads of one attribute share a single
//!   device call
//! - **Shared listeners**: one device-side listener per attribute, whatever
//!   the number of subscribers, released when the last one leaves
//! - **Polling fallback**: attributes that cannot push events are polled
//! - **Batched delivery**: each client receives the latest CHANGE, CONFIG
//!   and ERROR per attribute once per delivery interval
//! - **Bounded resources**: pooled device handles with LRU eviction, cached
//!   metadata with a TTL, bounded outbound queues
//!
//! # Device Access
//!
//! The gateway does no I/O of its own. Implement
//! [`protocol::DeviceConnector`] and [`protocol::DeviceHandle`] for your
//! transport, or use [`protocol::MemoryConnector`] for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use attrgate::{AttributeKey, Gateway, GatewayConfig, protocol::MemoryConnector};
//!
//! #[tokio::main]
//! async fn main() -> attrgate::Result<()> {
//!     let devices = MemoryConnector::new();
//!     let temp: AttributeKey = "dev1/temp".parse()?;
//!     devices.insert(&temp, 21.5);
//!
//!     let gateway = Arc::new(Gateway::new(devices.clone(), GatewayConfig::default())?);
//!
//!     // One-shot read
//!     let value = gateway.read(&temp).await?;
//!     println!("temp = {}", value.value);
//!
//!     // Live updates
//!     let mut session = gateway.connect_client();
//!     gateway.subscribe(&temp, session.id()).await?;
//!     devices.set_value(&temp, 22.0);
//!
//!     if let Some(batch) = session.recv().await {
//!         println!("{} events", batch.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
mod gateway;
pub mod protocol;
pub mod reader;
pub mod subscription;
pub mod types;

pub use config::GatewayConfig;
pub use error::{ConfigError, DeliveryError, DeviceError, Error, Result, ValueError};
pub use event::{EventBatch, EventKind, EventPayload, EventRecord};
pub use gateway::{ClientSession, Gateway};
pub use types::{AttributeConfig, AttributeKey, AttributeValue, DataFormat, Quality, SubscriberId};
