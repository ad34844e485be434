// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subscription client
//!
//! A [`Subscription`] is an async iterator over validated messages from an
//! XRPC subscription. Underneath sits a keep-alive WebSocket that
//! reconnects with exponential backoff and jitter on network-shaped
//! failures, heartbeats with protocol pings, and recomputes the connection
//! (URL, parameters) on every attempt. Message frames are tagged with their
//! full `$type` before being handed to the caller's validation hook; error
//! frames terminate the iterator with a typed error.

mod socket;
mod subscription;

pub use socket::{reconnectable, KeepAliveOpts};
pub use subscription::{Subscription, SubscriptionError, SubscriptionOpts};
