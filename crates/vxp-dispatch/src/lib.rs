// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dispatch engine for the vCD extension proxy.
//!
//! Data flow: broker delivery → [`consumer::Dispatcher`] (ack + route) →
//! [`worker`] (backend HTTP call) → [`publisher::ReplyPublisher`] → broker.
//! The routing table and extension descriptors are immutable after
//! registration; the only shared mutable state is the broker channel, which
//! `lapin` makes safe to use from concurrent workers.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod consumer;
pub mod inflight;
pub mod precheck;
pub mod publisher;
pub mod routing;
pub mod worker;

pub use backend::ExtensionRuntime;
pub use consumer::{DispatchError, Dispatcher};
pub use inflight::InflightTracker;
pub use precheck::{AllowAll, PreCheck};
pub use publisher::{ReplyProperties, ReplyPublisher};
pub use routing::RoutingTable;
