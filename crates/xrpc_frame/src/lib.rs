// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Binary framing for XRPC subscription streams
//!
//! A frame is two concatenated CBOR items: a small header map (`op`, and for
//! messages an optional type discriminator `t`), then an opaque body. Frames
//! travel as binary WebSocket messages in both directions.

mod frame;
pub mod value;

pub use frame::{Frame, FrameError};
