// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The XRPC request-dispatch engine
//!
//! Queries and procedures arrive over HTTP at `/xrpc/<nsid>`, subscriptions
//! over WebSocket at the same path. [`XrpcServer`] resolves the NSID against
//! the lexicon registry, runs auth and layered rate limiting in a fixed
//! order, decodes and validates parameters and bodies against the method's
//! schemas, invokes the registered handler, and renders results and errors
//! through a single taxonomy. [`Server`] is a minimal hyper loop for feeding
//! it connections.

pub mod auth;
pub mod body;
mod dispatch;
mod error;
pub mod params;
pub mod response;
mod routes;
mod server;
mod stream;

pub use auth::{basic_credentials, bearer_token, verifier, Auth, AuthContext, AuthVerifier};
pub use body::{HandlerInput, InputBody};
pub use dispatch::{Options, RateLimitBypass, RateLimitOptions, RegisterError, XrpcServer};
pub use error::{convert_error, ErrorKind, ErrorParser, XrpcError};
pub use routes::{
    handler, stream_handler, ByteStream, Handler, HandlerOutput, MessageStream, RouteConfig,
    RouteRateLimit, StopSignal, StreamContext, StreamHandler, StreamItem, StreamRouteConfig,
    XrpcContext,
};
pub use server::Server;
