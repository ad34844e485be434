// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The request-dispatch engine
//!
//! One [`XrpcServer`] holds the lexicon registry, the registered routes, and
//! the rate-limit configuration; [`XrpcServer::respond`] is the catch-all
//! every `/xrpc/*` request funnels through. The per-request order is fixed:
//! method resolution, auth, global rate limits, body parsing, parameter
//! validation, route rate limits, handler, response validation,
//! serialization. Failures at any stage render through the error taxonomy.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Body;
use tracing::{debug, error};

use lexicon::{DataValue, Lexicons, MethodDef, MethodKind};
use nsid::parse_xrpc_path;
use rate_limit::{
    tightest, ConsumeOpts, LimiterContext, MemoryStore, RateLimitDecision, RateLimitOutcome,
    RateLimiter, RateLimiterStore,
};

use crate::auth::AuthContext;
use crate::body::{is_json, parse_handler_input};
use crate::error::{convert_error, invalid_input, invalid_output, ErrorParser, XrpcError};
use crate::params::decode_query_params;
use crate::response::{self, set_rate_limit_headers, GenericResponse};
use crate::routes::{
    HandlerOutput, RouteConfig, RouteLimiters, RouteRateLimit, StreamRouteConfig, XrpcContext,
};
use crate::stream;

/// Skips every rate limiter for a request when it returns true (e.g. an
/// internal admin header).
pub type RateLimitBypass = Arc<dyn Fn(&LimiterContext<'_>) -> bool + Send + Sync>;

/// Rate-limit wiring shared by all routes.
pub struct RateLimitOptions {
    /// Limiters applied to every dispatched request.
    pub global: Vec<Arc<RateLimiter>>,
    /// Named limiters routes may reference.
    pub shared: HashMap<String, Arc<RateLimiter>>,
    /// Store backing limiters declared inline on routes.
    pub store: Arc<dyn RateLimiterStore>,
    pub bypass: Option<RateLimitBypass>,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            global: Vec::new(),
            shared: HashMap::new(),
            store: Arc::new(MemoryStore::new()),
            bypass: None,
        }
    }
}

/// Engine-wide options.
pub struct Options {
    /// Maximum request body size, applied to raw and decompressed bytes.
    pub blob_limit: u64,
    /// Validate success outputs against declared schemas.
    pub validate_response: bool,
    /// Hook translating unrecognized handler errors.
    pub error_parser: Option<ErrorParser>,
    pub rate_limits: RateLimitOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            blob_limit: 5 * 1024 * 1024,
            validate_response: false,
            error_parser: None,
            rate_limits: RateLimitOptions::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegisterError {
    #[error("method {0} is not in the lexicon registry")]
    UnknownMethod(String),
    #[error("method {nsid} is a {actual:?}, not a {expected:?}")]
    WrongKind {
        nsid: String,
        expected: MethodKind,
        actual: MethodKind,
    },
    #[error("method {0} is already registered")]
    AlreadyRegistered(String),
    #[error("route references unknown shared rate limiter {0:?}")]
    UnknownSharedLimiter(String),
}

struct Route {
    kind: MethodKind,
    config: RouteConfig,
    /// Shared refs resolved and inline buckets built, with per-route
    /// overrides attached.
    limiters: RouteLimiters,
}

/// The dispatch engine.
pub struct XrpcServer {
    lexicons: Arc<Lexicons>,
    options: Options,
    routes: HashMap<String, Route>,
    streams: HashMap<String, StreamRouteConfig>,
}

impl XrpcServer {
    pub fn new(lexicons: Arc<Lexicons>, options: Options) -> Self {
        Self {
            lexicons,
            options,
            routes: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    pub fn lexicons(&self) -> &Arc<Lexicons> {
        &self.lexicons
    }

    /// Register a query or procedure; the lexicon decides which.
    pub fn method(
        &mut self,
        nsid: &str,
        config: impl Into<RouteConfig>,
    ) -> Result<(), RegisterError> {
        let config = config.into();
        let def = self
            .lexicons
            .get(nsid)
            .ok_or_else(|| RegisterError::UnknownMethod(nsid.to_owned()))?;
        let kind = def.kind();
        if kind == MethodKind::Subscription {
            return Err(RegisterError::WrongKind {
                nsid: nsid.to_owned(),
                expected: MethodKind::Query,
                actual: kind,
            });
        }
        if self.routes.contains_key(nsid) {
            return Err(RegisterError::AlreadyRegistered(nsid.to_owned()));
        }

        let limiters = self.resolve_route_limiters(nsid, &config.rate_limits)?;
        self.routes.insert(
            nsid.to_owned(),
            Route {
                kind,
                config,
                limiters,
            },
        );
        Ok(())
    }

    /// Register a subscription.
    pub fn stream_method(
        &mut self,
        nsid: &str,
        config: impl Into<StreamRouteConfig>,
    ) -> Result<(), RegisterError> {
        let def = self
            .lexicons
            .get(nsid)
            .ok_or_else(|| RegisterError::UnknownMethod(nsid.to_owned()))?;
        if def.kind() != MethodKind::Subscription {
            return Err(RegisterError::WrongKind {
                nsid: nsid.to_owned(),
                expected: MethodKind::Subscription,
                actual: def.kind(),
            });
        }
        if self.streams.contains_key(nsid) {
            return Err(RegisterError::AlreadyRegistered(nsid.to_owned()));
        }
        self.streams.insert(nsid.to_owned(), config.into());
        Ok(())
    }

    fn resolve_route_limiters(
        &self,
        nsid: &str,
        declared: &[RouteRateLimit],
    ) -> Result<RouteLimiters, RegisterError> {
        let mut limiters = Vec::with_capacity(declared.len());
        for (i, limit) in declared.iter().enumerate() {
            match limit {
                RouteRateLimit::Shared {
                    name,
                    calc_key,
                    calc_points,
                } => {
                    let limiter = self
                        .options
                        .rate_limits
                        .shared
                        .get(name)
                        .ok_or_else(|| RegisterError::UnknownSharedLimiter(name.clone()))?;
                    limiters.push((
                        limiter.clone(),
                        ConsumeOpts {
                            calc_key: calc_key.clone(),
                            calc_points: calc_points.clone(),
                        },
                    ));
                }
                RouteRateLimit::Inline {
                    duration,
                    points,
                    calc_key,
                    calc_points,
                } => {
                    let limiter = Arc::new(RateLimiter::new(
                        self.options.rate_limits.store.clone(),
                        format!("{nsid}-{i}"),
                        *duration,
                        *points,
                    ));
                    limiters.push((
                        limiter,
                        ConsumeOpts {
                            calc_key: calc_key.clone(),
                            calc_points: calc_points.clone(),
                        },
                    ));
                }
            }
        }
        Ok(Arc::new(limiters))
    }

    /// The catch-all: resolve, dispatch, and render any `/xrpc/*` request.
    pub async fn respond<B>(&self, req: Request<B>) -> GenericResponse
    where
        B: Body + Unpin + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        if req.method() == Method::OPTIONS {
            return response::empty();
        }
        if !req.uri().path().starts_with("/xrpc/") {
            return response::not_found();
        }

        let nsid = match parse_xrpc_path(req.uri().path()) {
            Ok(nsid) => nsid.to_owned(),
            Err(_) => {
                return self.render_error(
                    "",
                    XrpcError::invalid_request("invalid xrpc path"),
                    &RateLimitDecision::Allowed(None),
                )
            }
        };

        // method resolution comes first; unknown methods outrank rate limits
        let Some(def) = self.lexicons.get(&nsid) else {
            return self.render_error(
                &nsid,
                XrpcError::method_not_implemented(),
                &RateLimitDecision::Allowed(None),
            );
        };

        let bypass = {
            let ctx = LimiterContext {
                headers: req.headers(),
                nsid: &nsid,
            };
            self.options
                .rate_limits
                .bypass
                .as_ref()
                .is_some_and(|bypass| bypass(&ctx))
        };

        match def.kind() {
            MethodKind::Subscription => {
                if !stream::is_websocket_upgrade(req.headers()) {
                    return self.render_error(
                        &nsid,
                        XrpcError::invalid_request(
                            "Subscription methods are served over WebSocket",
                        ),
                        &RateLimitDecision::Allowed(None),
                    );
                }
                let Some(config) = self.streams.get(&nsid) else {
                    // the upgrade is refused outright when nothing serves it
                    return response::not_found();
                };
                // global limiters gate the upgrade itself
                match self.consume_global(&nsid, req.headers(), bypass).await {
                    Ok(_) => {}
                    Err((err, decision)) => return self.render_error(&nsid, err, &decision),
                }
                stream::handle_upgrade(self.lexicons.clone(), nsid, config, req)
            }
            kind => {
                let expected = match kind {
                    MethodKind::Query => Method::GET,
                    _ => Method::POST,
                };
                if req.method() != expected {
                    return self.render_error(
                        &nsid,
                        XrpcError::invalid_request(format!(
                            "Incorrect HTTP method ({}) expected {expected}",
                            req.method()
                        )),
                        &RateLimitDecision::Allowed(None),
                    );
                }
                let Some(route) = self.routes.get(&nsid) else {
                    return self.render_error(
                        &nsid,
                        XrpcError::method_not_implemented(),
                        &RateLimitDecision::Allowed(None),
                    );
                };
                match self.run_route(&nsid, def, route, req, bypass).await {
                    Ok(response) => response,
                    Err(err) => self.render_error(&nsid, err, &RateLimitDecision::Allowed(None)),
                }
            }
        }
    }

    /// Run the global limiters; on exceeded, the caller renders the 429.
    async fn consume_global(
        &self,
        nsid: &str,
        headers: &http::HeaderMap,
        bypass: bool,
    ) -> Result<Vec<RateLimitOutcome>, (XrpcError, RateLimitDecision)> {
        let mut outcomes = Vec::new();
        if bypass {
            return Ok(outcomes);
        }
        let ctx = LimiterContext { headers, nsid };
        let opts = ConsumeOpts::default();
        for limiter in &self.options.rate_limits.global {
            match limiter.consume(&ctx, &opts).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => return Err((err.into(), RateLimitDecision::Allowed(None))),
            }
        }
        if let RateLimitDecision::Exceeded(status) = tightest(outcomes.clone()) {
            return Err((
                XrpcError::rate_limit_exceeded(),
                RateLimitDecision::Exceeded(status),
            ));
        }
        Ok(outcomes)
    }

    async fn run_route<B>(
        &self,
        nsid: &str,
        def: &MethodDef,
        route: &Route,
        req: Request<B>,
        bypass: bool,
    ) -> Result<GenericResponse, XrpcError>
    where
        B: Body + Unpin + Send + 'static,
        B::Error: std::error::Error + Send + Sync + 'static,
    {
        // auth before anything touches the body
        let auth = match &route.config.auth {
            Some(verifier) => Some(
                verifier(AuthContext {
                    headers: req.headers().clone(),
                    nsid: nsid.to_owned(),
                })
                .await?,
            ),
            None => None,
        };

        // global limiters fire after auth so bypass logic can trust the
        // request, but before any body work
        let mut outcomes = match self.consume_global(nsid, req.headers(), bypass).await {
            Ok(outcomes) => outcomes,
            Err((err, decision)) => return Ok(self.render_error(nsid, err, &decision)),
        };

        let (parts, body) = req.into_parts();

        let declared_input = match route.kind {
            MethodKind::Procedure => def.input(),
            _ => None,
        };
        let input = parse_handler_input(
            &self.lexicons,
            nsid,
            declared_input,
            &parts.headers,
            body,
            self.options.blob_limit,
        )
        .await?;

        let params = decode_query_params(parts.uri.query(), def.parameters());
        self.lexicons
            .assert_valid_xrpc_params(nsid, &params)
            .map_err(invalid_input)?;

        // route limiters, now that auth and validation both passed
        if !bypass {
            let ctx = LimiterContext {
                headers: &parts.headers,
                nsid,
            };
            for (limiter, opts) in route.limiters.iter() {
                outcomes.push(limiter.consume(&ctx, opts).await?);
            }
        }
        let decision = tightest(outcomes);
        if let RateLimitDecision::Exceeded(_) = &decision {
            return Ok(self.render_error(nsid, XrpcError::rate_limit_exceeded(), &decision));
        }

        let ctx = XrpcContext {
            nsid: nsid.to_owned(),
            params,
            input,
            auth,
            headers: parts.headers,
            route_limiters: route.limiters.clone(),
        };
        let output = (route.config.handler)(ctx)
            .await
            .map_err(|err| self.parse_handler_error(err))?;

        let mut response = self.render_output(nsid, output)?;
        if let RateLimitDecision::Allowed(Some(status)) = &decision {
            set_rate_limit_headers(&mut response, status);
        }
        Ok(response)
    }

    /// Run a typed handler error back through the process-wide parser, so a
    /// deployment's custom taxonomy applies uniformly.
    fn parse_handler_error(&self, err: XrpcError) -> XrpcError {
        match &self.options.error_parser {
            Some(parser) => convert_error(anyhow::Error::new(err), Some(parser)),
            None => err,
        }
    }

    fn render_output(
        &self,
        nsid: &str,
        output: HandlerOutput,
    ) -> Result<GenericResponse, XrpcError> {
        match output {
            HandlerOutput::Void => {
                if self.options.validate_response {
                    self.lexicons
                        .assert_valid_xrpc_output(nsid, &DataValue::Null)
                        .map_err(invalid_output)?;
                }
                Ok(response::empty())
            }
            HandlerOutput::Body {
                encoding,
                body,
                headers,
            } => {
                if self.options.validate_response {
                    self.lexicons
                        .assert_valid_xrpc_output(nsid, &body)
                        .map_err(invalid_output)?;
                }
                let (content_type, bytes) = serialize_body(&encoding, body);
                let mut response = response::full(StatusCode::OK, &content_type, bytes);
                merge_headers(&mut response, headers)?;
                Ok(response)
            }
            HandlerOutput::Buffer {
                encoding,
                buffer,
                headers,
            } => {
                let mut response = response::full(StatusCode::OK, &encoding, buffer);
                merge_headers(&mut response, headers)?;
                Ok(response)
            }
            HandlerOutput::Stream {
                encoding,
                stream,
                headers,
            } => {
                let body = StreamBody::new(stream.map_ok(hyper::body::Frame::data));
                let mut response = hyper::Response::new(BodyExt::boxed(body));
                if let Ok(value) = HeaderValue::from_str(&encoding) {
                    response.headers_mut().insert(CONTENT_TYPE, value);
                }
                merge_headers(&mut response, headers)?;
                Ok(response)
            }
        }
    }

    fn render_error(
        &self,
        nsid: &str,
        err: XrpcError,
        decision: &RateLimitDecision,
    ) -> GenericResponse {
        if err.status().is_server_error() {
            error!("error in {nsid}: {}", err.log_message());
        } else {
            debug!("rejected {nsid}: {}: {}", err.wire_name(), err.wire_message());
        }
        let mut response = response::error(&err);
        match decision {
            RateLimitDecision::Allowed(Some(status)) | RateLimitDecision::Exceeded(status) => {
                set_rate_limit_headers(&mut response, status);
            }
            RateLimitDecision::Allowed(None) => {}
        }
        response
    }
}

fn serialize_body(encoding: &str, body: DataValue) -> (String, Vec<u8>) {
    if is_json(encoding) {
        // serializing a serde_json::Value can't fail
        let bytes = serde_json::to_vec(&body.to_json()).unwrap();
        return ("application/json; charset=utf-8".to_owned(), bytes);
    }
    if encoding.starts_with("text/") {
        let bytes = match body {
            DataValue::String(s) => s.into_bytes(),
            other => other.to_json().to_string().into_bytes(),
        };
        return (format!("{encoding}; charset=utf-8"), bytes);
    }
    let bytes = match body {
        DataValue::Bytes(b) => b,
        DataValue::String(s) => s.into_bytes(),
        other => other.to_json().to_string().into_bytes(),
    };
    (encoding.to_owned(), bytes)
}

fn merge_headers(
    response: &mut GenericResponse,
    headers: Vec<(String, String)>,
) -> Result<(), XrpcError> {
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| XrpcError::internal(anyhow::Error::new(e).context("bad response header name")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| XrpcError::internal(anyhow::Error::new(e).context("bad response header value")))?;
        response.headers_mut().insert(name, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use http_body_util::Full;

    use lexicon::{BodySchema, ParamType, ParamsSchema, ProcedureDef, QueryDef};

    use crate::auth::{verifier, Auth};
    use crate::routes::{handler, HandlerOutput, RouteRateLimit};

    fn lexicons() -> Arc<Lexicons> {
        let mut lex = Lexicons::new();
        lex.add(
            "io.example.ping",
            MethodDef::Query(QueryDef {
                parameters: Some(
                    ParamsSchema::default()
                        .property("message", ParamType::String)
                        .require("message"),
                ),
                output: Some(BodySchema::encoding("text/plain")),
                errors: vec![],
            }),
        )
        .unwrap();
        lex.add(
            "io.example.submit",
            MethodDef::Procedure(ProcedureDef {
                input: Some(BodySchema::json(
                    lexicon::ObjectSchema::default()
                        .property("value", lexicon::PropType::Integer)
                        .require("value"),
                )),
                output: Some(BodySchema::encoding("application/json")),
                ..Default::default()
            }),
        )
        .unwrap();
        Arc::new(lex)
    }

    fn echo_route() -> RouteConfig {
        RouteConfig::new(handler(|ctx| async move {
            match ctx.params.get("message") {
                Some(lexicon::ParamValue::String(message)) => {
                    Ok(HandlerOutput::text(message.clone()))
                }
                _ => Ok(HandlerOutput::text("")),
            }
        }))
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn post(path: &str, content_type: &str, body: &[u8]) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header("content-type", content_type)
            .body(Full::new(Bytes::copy_from_slice(body)))
            .unwrap()
    }

    async fn body_json(response: GenericResponse) -> serde_json::Value {
        let bytes = BodyExt::collect(response.into_body()).await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn resolves_and_serializes_a_query() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method("io.example.ping", echo_route()).unwrap();

        let response = xrpc.respond(get("/xrpc/io.example.ping?message=hey")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "text/plain; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn options_requests_short_circuit() {
        let xrpc = XrpcServer::new(lexicons(), Options::default());
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/xrpc/io.example.ping")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = xrpc.respond(request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn routing_failures_map_through_the_taxonomy() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method("io.example.ping", echo_route()).unwrap();

        // outside /xrpc/
        let response = xrpc.respond(get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // unparseable NSID
        let response = xrpc.respond(get("/xrpc/not_an_nsid")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["message"], "invalid xrpc path");

        // not in the lexicon
        let response = xrpc.respond(get("/xrpc/io.example.nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);

        // wrong verb
        let response = xrpc
            .respond(post("/xrpc/io.example.ping?message=x", "application/json", b"{}"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn registration_is_checked_against_the_lexicon() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        assert!(matches!(
            xrpc.method("io.example.nope", echo_route()),
            Err(RegisterError::UnknownMethod(_))
        ));
        xrpc.method("io.example.ping", echo_route()).unwrap();
        assert!(matches!(
            xrpc.method("io.example.ping", echo_route()),
            Err(RegisterError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            xrpc.method(
                "io.example.ping",
                RouteConfig::new(handler(|_| async { Ok(HandlerOutput::Void) }))
                    .rate_limit(RouteRateLimit::shared("nonexistent")),
            ),
            Err(RegisterError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn unknown_shared_limiters_fail_registration() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        assert!(matches!(
            xrpc.method(
                "io.example.ping",
                echo_route().rate_limit(RouteRateLimit::shared("nonexistent")),
            ),
            Err(RegisterError::UnknownSharedLimiter(_))
        ));
    }

    #[tokio::test]
    async fn auth_failures_outrank_body_validation() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method(
            "io.example.submit",
            RouteConfig::new(handler(|_| async { Ok(HandlerOutput::Void) })).auth(verifier(
                |_ctx| async { Err::<Auth, _>(XrpcError::auth_required("Authentication Required")) },
            )),
        )
        .unwrap();

        // body is not even json; the auth failure must win
        let response = xrpc
            .respond(post("/xrpc/io.example.submit", "application/json", b"{nope"))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "AuthenticationRequired");
    }

    #[tokio::test]
    async fn route_limits_fire_after_validation() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method(
            "io.example.ping",
            echo_route().rate_limit(RouteRateLimit::inline(Duration::from_secs(300), 1)),
        )
        .unwrap();

        // an invalid request never reaches the route bucket
        for _ in 0..3 {
            let response = xrpc.respond(get("/xrpc/io.example.ping")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
        // so the first valid request still finds a full bucket
        let response = xrpc.respond(get("/xrpc/io.example.ping?message=x")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = xrpc.respond(get("/xrpc/io.example.ping?message=x")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn handler_headers_are_merged_on_success() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method(
            "io.example.ping",
            RouteConfig::new(handler(|_| async {
                Ok(HandlerOutput::text("pong").with_header("x-custom", "yes"))
            })),
        )
        .unwrap();
        let response = xrpc.respond(get("/xrpc/io.example.ping?message=x")).await;
        assert_eq!(response.headers()["x-custom"], "yes");
    }

    #[tokio::test]
    async fn json_outputs_use_the_ipld_projection() {
        let mut xrpc = XrpcServer::new(lexicons(), Options::default());
        xrpc.method(
            "io.example.submit",
            RouteConfig::new(handler(|_| async {
                Ok(HandlerOutput::json(DataValue::from_json(&serde_json::json!({
                    "value": 1,
                    "blob": {"$bytes": "AAECAw"},
                }))))
            })),
        )
        .unwrap();
        let response = xrpc
            .respond(post("/xrpc/io.example.submit", "application/json", b"{\"value\":1}"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/json; charset=utf-8"
        );
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"value": 1, "blob": {"$bytes": "AAECAw"}})
        );
    }

    #[tokio::test]
    async fn error_parser_translates_handler_errors() {
        // the parser sees the whole chain, internal causes included
        let parser: ErrorParser = Arc::new(|err| {
            format!("{err:#}")
                .contains("special")
                .then(|| XrpcError::new(crate::error::ErrorKind::UpstreamTimeout, "upstream slow"))
        });
        let mut xrpc = XrpcServer::new(
            lexicons(),
            Options {
                error_parser: Some(parser),
                ..Options::default()
            },
        );
        xrpc.method(
            "io.example.ping",
            RouteConfig::new(handler(|_| async {
                Err::<HandlerOutput, _>(XrpcError::internal(anyhow::anyhow!("special failure")))
            })),
        )
        .unwrap();
        let response = xrpc.respond(get("/xrpc/io.example.ping?message=x")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["error"], "UpstreamTimeout");
    }
}
