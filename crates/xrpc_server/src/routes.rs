// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Route configuration and handler contracts
//!
//! Handlers return `Result<HandlerOutput, XrpcError>`: the error side *is*
//! the error-result shape (status + name + message), and the success side is
//! a closed sum over void, a data body, a pipe-through buffer, or a
//! pipe-through stream. Subscription handlers instead return a lazy stream
//! of messages that must observe the stop signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use http::HeaderMap;
use tokio::sync::watch;

use lexicon::{DataValue, Params};
use rate_limit::{CalcKey, CalcPoints, ConsumeOpts, LimiterContext, RateLimiter};
use xrpc_frame::Frame;

use crate::auth::{Auth, AuthVerifier};
use crate::body::HandlerInput;
use crate::error::XrpcError;

/// Bytes produced by a pipe-through stream response.
pub type ByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, anyhow::Error>> + Send + Sync + 'static>>;

/// A successful handler result.
pub enum HandlerOutput {
    /// 200 with no body.
    Void,
    /// A data body serialized per its encoding (JSON projection for JSON,
    /// charset-suffixed text, raw otherwise).
    Body {
        encoding: String,
        body: DataValue,
        headers: Vec<(String, String)>,
    },
    /// Pipe-through: bytes sent as-is under the given encoding.
    Buffer {
        encoding: String,
        buffer: Bytes,
        headers: Vec<(String, String)>,
    },
    /// Pipe-through: a byte stream sent as-is under the given encoding.
    Stream {
        encoding: String,
        stream: ByteStream,
        headers: Vec<(String, String)>,
    },
}

impl HandlerOutput {
    pub fn json(body: DataValue) -> Self {
        HandlerOutput::Body {
            encoding: "application/json".to_owned(),
            body,
            headers: Vec::new(),
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        HandlerOutput::Body {
            encoding: "text/plain".to_owned(),
            body: DataValue::String(body.into()),
            headers: Vec::new(),
        }
    }

    pub fn encoded(encoding: impl Into<String>, body: DataValue) -> Self {
        HandlerOutput::Body {
            encoding: encoding.into(),
            body,
            headers: Vec::new(),
        }
    }

    pub fn buffer(encoding: impl Into<String>, buffer: impl Into<Bytes>) -> Self {
        HandlerOutput::Buffer {
            encoding: encoding.into(),
            buffer: buffer.into(),
            headers: Vec::new(),
        }
    }

    pub fn stream(encoding: impl Into<String>, stream: ByteStream) -> Self {
        HandlerOutput::Stream {
            encoding: encoding.into(),
            stream,
            headers: Vec::new(),
        }
    }

    /// Attach a response header to merge on success.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let entry = (name.into(), value.into());
        match &mut self {
            HandlerOutput::Void => {}
            HandlerOutput::Body { headers, .. }
            | HandlerOutput::Buffer { headers, .. }
            | HandlerOutput::Stream { headers, .. } => headers.push(entry),
        }
        self
    }
}

/// Route limiters resolved at registration, with any per-route overrides.
pub(crate) type RouteLimiters = Arc<Vec<(Arc<RateLimiter>, ConsumeOpts)>>;

/// Everything a query/procedure handler gets.
pub struct XrpcContext {
    pub nsid: String,
    pub params: Params,
    pub input: Option<HandlerInput>,
    pub auth: Option<Auth>,
    pub headers: HeaderMap,
    pub(crate) route_limiters: RouteLimiters,
}

impl XrpcContext {
    /// Clear this route's rate-limit counters for the current caller, e.g.
    /// to reverse a preliminary consumption after the real cost is known.
    pub async fn reset_route_rate_limits(&self) -> Result<(), XrpcError> {
        let ctx = LimiterContext {
            headers: &self.headers,
            nsid: &self.nsid,
        };
        for (limiter, opts) in self.route_limiters.iter() {
            limiter.reset(&ctx, opts).await?;
        }
        Ok(())
    }
}

/// A query/procedure handler.
pub type Handler = Arc<
    dyn Fn(XrpcContext) -> Pin<Box<dyn Future<Output = Result<HandlerOutput, XrpcError>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(XrpcContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutput, XrpcError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// A rate limit declared on one route.
pub enum RouteRateLimit {
    /// Reference to a named shared limiter, optionally re-keyed.
    Shared {
        name: String,
        calc_key: Option<CalcKey>,
        calc_points: Option<CalcPoints>,
    },
    /// A bucket private to this route.
    Inline {
        duration: Duration,
        points: u32,
        calc_key: Option<CalcKey>,
        calc_points: Option<CalcPoints>,
    },
}

impl RouteRateLimit {
    pub fn shared(name: impl Into<String>) -> Self {
        RouteRateLimit::Shared {
            name: name.into(),
            calc_key: None,
            calc_points: None,
        }
    }

    pub fn inline(duration: Duration, points: u32) -> Self {
        RouteRateLimit::Inline {
            duration,
            points,
            calc_key: None,
            calc_points: None,
        }
    }

    pub fn with_calc_key(mut self, f: CalcKey) -> Self {
        match &mut self {
            RouteRateLimit::Shared { calc_key, .. } | RouteRateLimit::Inline { calc_key, .. } => {
                *calc_key = Some(f)
            }
        }
        self
    }

    pub fn with_calc_points(mut self, f: CalcPoints) -> Self {
        match &mut self {
            RouteRateLimit::Shared { calc_points, .. }
            | RouteRateLimit::Inline { calc_points, .. } => *calc_points = Some(f),
        }
        self
    }
}

/// Configuration for one query/procedure route.
pub struct RouteConfig {
    pub(crate) handler: Handler,
    pub(crate) auth: Option<AuthVerifier>,
    pub(crate) rate_limits: Vec<RouteRateLimit>,
}

impl RouteConfig {
    pub fn new(handler: Handler) -> Self {
        Self {
            handler,
            auth: None,
            rate_limits: Vec::new(),
        }
    }

    pub fn auth(mut self, verifier: AuthVerifier) -> Self {
        self.auth = Some(verifier);
        self
    }

    pub fn rate_limit(mut self, limit: RouteRateLimit) -> Self {
        self.rate_limits.push(limit);
        self
    }
}

impl From<Handler> for RouteConfig {
    fn from(handler: Handler) -> Self {
        RouteConfig::new(handler)
    }
}

/// A signal flipped when the peer goes away or the server shuts the stream
/// down; producers should wind down promptly once it fires.
#[derive(Debug, Clone)]
pub struct StopSignal(pub(crate) watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves when the stream is being torn down.
    pub async fn stopped(mut self) {
        // an error means the sender is gone, which is also a stop
        let _ = self.0.wait_for(|&stopped| stopped).await;
    }
}

/// One item yielded by a subscription producer.
pub enum StreamItem {
    /// A pre-built frame, sent as-is.
    Frame(Frame),
    /// A message body; `$type` handling and framing are the server's job.
    Value(DataValue),
}

/// The lazy message sequence a subscription handler returns.
pub type MessageStream = BoxStream<'static, Result<StreamItem, XrpcError>>;

/// What a subscription handler gets.
pub struct StreamContext {
    pub nsid: String,
    pub params: Params,
    pub headers: HeaderMap,
    pub auth: Option<Auth>,
    pub stop: StopSignal,
}

/// A subscription handler.
pub type StreamHandler = Arc<
    dyn Fn(StreamContext) -> Pin<Box<dyn Future<Output = Result<MessageStream, XrpcError>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(StreamContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<MessageStream, XrpcError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Configuration for one subscription route.
pub struct StreamRouteConfig {
    pub(crate) handler: StreamHandler,
    pub(crate) auth: Option<AuthVerifier>,
}

impl StreamRouteConfig {
    pub fn new(handler: StreamHandler) -> Self {
        Self { handler, auth: None }
    }

    pub fn auth(mut self, verifier: AuthVerifier) -> Self {
        self.auth = Some(verifier);
        self
    }
}

impl From<StreamHandler> for StreamRouteConfig {
    fn from(handler: StreamHandler) -> Self {
        StreamRouteConfig::new(handler)
    }
}
