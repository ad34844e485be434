// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error taxonomy every failure funnels through
//!
//! Library code and handlers alike end up as an [`XrpcError`]: a kind with a
//! fixed HTTP status, an optional custom wire name (declared lexicon errors,
//! auth subcodes), and an optional human message. Internal errors keep their
//! full cause for the logs but never leak it onto the wire.

use std::sync::Arc;

use hyper::StatusCode;

use lexicon::ValidationError;
use service_auth::ServiceAuthError;

/// The closed set of error kinds, each with its wire name and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    AuthRequired,
    Forbidden,
    PayloadTooLarge,
    RateLimitExceeded,
    InternalServerError,
    MethodNotImplemented,
    UpstreamFailure,
    UpstreamTimeout,
    NotEnoughResources,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::MethodNotImplemented => StatusCode::NOT_IMPLEMENTED,
            ErrorKind::UpstreamFailure => StatusCode::BAD_GATEWAY,
            ErrorKind::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::NotEnoughResources => StatusCode::INSUFFICIENT_STORAGE,
        }
    }

    /// Default wire `error` name.
    pub fn wire_name(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::AuthRequired => "AuthenticationRequired",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::PayloadTooLarge => "PayloadTooLarge",
            ErrorKind::RateLimitExceeded => "RateLimitExceeded",
            ErrorKind::InternalServerError => "InternalServerError",
            ErrorKind::MethodNotImplemented => "MethodNotImplemented",
            ErrorKind::UpstreamFailure => "UpstreamFailure",
            ErrorKind::UpstreamTimeout => "UpstreamTimeout",
            ErrorKind::NotEnoughResources => "NotEnoughResources",
        }
    }

    /// Default human-readable wire `message`.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "Invalid Request",
            ErrorKind::AuthRequired => "Authentication Required",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::PayloadTooLarge => "Payload Too Large",
            ErrorKind::RateLimitExceeded => "Rate Limit Exceeded",
            ErrorKind::InternalServerError => "Internal Server Error",
            ErrorKind::MethodNotImplemented => "Method Not Implemented",
            ErrorKind::UpstreamFailure => "Upstream Failure",
            ErrorKind::UpstreamTimeout => "Upstream Timeout",
            ErrorKind::NotEnoughResources => "Not Enough Resources",
        }
    }

    fn from_status(status: StatusCode) -> ErrorKind {
        match status {
            StatusCode::BAD_REQUEST => ErrorKind::InvalidRequest,
            StatusCode::UNAUTHORIZED => ErrorKind::AuthRequired,
            StatusCode::FORBIDDEN => ErrorKind::Forbidden,
            StatusCode::PAYLOAD_TOO_LARGE => ErrorKind::PayloadTooLarge,
            StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimitExceeded,
            StatusCode::NOT_IMPLEMENTED => ErrorKind::MethodNotImplemented,
            StatusCode::BAD_GATEWAY => ErrorKind::UpstreamFailure,
            StatusCode::GATEWAY_TIMEOUT => ErrorKind::UpstreamTimeout,
            StatusCode::INSUFFICIENT_STORAGE => ErrorKind::NotEnoughResources,
            _ => ErrorKind::InternalServerError,
        }
    }
}

/// One failed request.
#[derive(Debug)]
pub struct XrpcError {
    kind: ErrorKind,
    /// Overrides the kind's status for handler error-results.
    status: Option<StatusCode>,
    /// Custom wire `error` name (a declared lexicon error, an auth subcode).
    name: Option<String>,
    message: Option<String>,
    /// The underlying cause, retained for logs only.
    source: Option<anyhow::Error>,
}

impl std::fmt::Display for XrpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.wire_name(), self.wire_message())
    }
}

impl std::error::Error for XrpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(AsRef::<dyn std::error::Error + 'static>::as_ref)
    }
}

impl XrpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            name: None,
            message: Some(message.into()),
            source: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRequired, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PayloadTooLarge, message)
    }

    pub fn rate_limit_exceeded() -> Self {
        Self {
            kind: ErrorKind::RateLimitExceeded,
            status: None,
            name: None,
            message: None,
            source: None,
        }
    }

    pub fn method_not_implemented() -> Self {
        Self {
            kind: ErrorKind::MethodNotImplemented,
            status: None,
            name: None,
            message: None,
            source: None,
        }
    }

    /// An internal failure; `cause` goes to the logs, not the wire.
    pub fn internal(cause: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InternalServerError,
            status: None,
            name: None,
            message: None,
            source: Some(cause),
        }
    }

    /// A handler error-result with an explicit status.
    ///
    /// Statuses outside `[400, 600)` are coerced to 500.
    pub fn from_status(status: u16, name: Option<String>, message: Option<String>) -> Self {
        let status = StatusCode::from_u16(status)
            .ok()
            .filter(|s| s.is_client_error() || s.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            name,
            message,
            source: None,
        }
    }

    /// Set a custom wire `error` name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.kind.status())
    }

    /// The wire `error` name.
    pub fn wire_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.wire_name())
    }

    /// The wire `message`.
    ///
    /// 500s always report the generic message; internal detail stays in the
    /// logs.
    pub fn wire_message(&self) -> &str {
        if self.status() == StatusCode::INTERNAL_SERVER_ERROR {
            return ErrorKind::InternalServerError.default_message();
        }
        self.message.as_deref().unwrap_or_else(|| self.kind.default_message())
    }

    /// The full internal rendering, for logs.
    pub fn log_message(&self) -> String {
        match (&self.source, &self.message) {
            (Some(source), _) => format!("{source:#}"),
            (None, Some(message)) => message.clone(),
            (None, None) => self.kind.default_message().to_owned(),
        }
    }

    /// The JSON error body `{ "error": ..., "message": ... }`.
    pub fn wire_body(&self) -> serde_json::Value {
        serde_json::json!({
            "error": self.wire_name(),
            "message": self.wire_message(),
        })
    }
}

impl From<ServiceAuthError> for XrpcError {
    fn from(err: ServiceAuthError) -> Self {
        XrpcError::auth_required(err.to_string()).with_name(err.name())
    }
}

impl From<rate_limit::StoreError> for XrpcError {
    fn from(err: rate_limit::StoreError) -> Self {
        XrpcError::internal(err.into())
    }
}

/// Input-side schema violations are the caller's fault.
pub fn invalid_input(err: ValidationError) -> XrpcError {
    XrpcError::invalid_request(err.to_string())
}

/// Output-side schema violations are ours.
pub fn invalid_output(err: ValidationError) -> XrpcError {
    XrpcError::internal(anyhow::Error::new(err).context("handler output failed validation"))
}

/// Process-wide hook translating unrecognized handler errors into a typed
/// error before the default conversion applies.
pub type ErrorParser = Arc<dyn Fn(&anyhow::Error) -> Option<XrpcError> + Send + Sync>;

/// Convert an arbitrary handler failure, consulting `parser` first.
///
/// The parser is documented as must-not-panic but is not trusted to comply;
/// a panic inside it counts as "no translation".
pub fn convert_error(err: anyhow::Error, parser: Option<&ErrorParser>) -> XrpcError {
    if let Some(parser) = parser {
        let parsed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| parser(&err)));
        match parsed {
            Ok(Some(xrpc_err)) => return xrpc_err,
            Ok(None) => {}
            Err(_) => {
                tracing::warn!("errorParser panicked; falling back to default conversion");
            }
        }
    }
    match err.downcast::<XrpcError>() {
        Ok(xrpc_err) => xrpc_err,
        Err(err) => XrpcError::internal(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(XrpcError::invalid_request("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(XrpcError::auth_required("x").status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            XrpcError::rate_limit_exceeded().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            XrpcError::method_not_implemented().status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            XrpcError::internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn out_of_range_statuses_coerce_to_500() {
        for status in [200, 302, 399, 600, 700] {
            let err = XrpcError::from_status(status, None, None);
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR, "{status}");
        }
        let err = XrpcError::from_status(507, None, None);
        assert_eq!(err.status(), StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(err.wire_name(), "NotEnoughResources");
    }

    #[test]
    fn internal_errors_do_not_leak_detail() {
        let err = XrpcError::internal(anyhow::anyhow!("db password is hunter2"));
        assert_eq!(err.wire_message(), "Internal Server Error");
        assert!(err.log_message().contains("hunter2"));
    }

    #[test]
    fn custom_names_and_messages() {
        let err = XrpcError::invalid_request("Params must have the property \"countdown\"")
            .with_name("MissingCountdown");
        assert_eq!(
            err.wire_body(),
            serde_json::json!({
                "error": "MissingCountdown",
                "message": "Params must have the property \"countdown\"",
            })
        );
    }

    #[test]
    fn auth_errors_map_to_subcoded_401s() {
        let err: XrpcError = ServiceAuthError::JwtExpired.into();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.wire_name(), "JwtExpired");
        assert_eq!(err.wire_message(), "jwt expired");
    }

    #[test]
    fn error_parser_is_consulted_and_contained() {
        let parser: ErrorParser = Arc::new(|err| {
            err.to_string()
                .contains("upstream")
                .then(|| XrpcError::new(ErrorKind::UpstreamFailure, "upstream broke"))
        });
        let err = convert_error(anyhow::anyhow!("upstream timeout"), Some(&parser));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        let err = convert_error(anyhow::anyhow!("unrelated"), Some(&parser));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let panicking: ErrorParser = Arc::new(|_| panic!("bad parser"));
        let err = convert_error(anyhow::anyhow!("whatever"), Some(&panicking));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn typed_errors_survive_anyhow_roundtrip() {
        let original = XrpcError::forbidden("no access");
        let err = convert_error(anyhow::Error::new(original), None);
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.wire_message(), "no access");
    }
}
