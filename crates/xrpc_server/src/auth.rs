// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request authentication
//!
//! Routes may carry a verifier; it runs after the request is resolved to a
//! method but before the body is parsed, so a failed login never pays for
//! body work (and auth failures mask later validation failures, which is the
//! order callers observe). Whatever the verifier returns is attached to the
//! request context for the handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::HeaderMap;

use crate::error::XrpcError;

/// Credentials a verifier established for one request.
///
/// Both halves are opaque to the engine: `credentials` is whatever the
/// handler needs to authorize the caller, `artifacts` is anything worth
/// carrying alongside (e.g. the validated token payload). Dropped with the
/// request.
#[derive(Debug, Clone, Default)]
pub struct Auth {
    pub credentials: serde_json::Value,
    pub artifacts: Option<serde_json::Value>,
}

/// What a verifier sees: the request headers and the resolved method.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub headers: HeaderMap,
    pub nsid: String,
}

/// A route's authentication hook.
pub type AuthVerifier = Arc<
    dyn Fn(AuthContext) -> Pin<Box<dyn Future<Output = Result<Auth, XrpcError>> + Send>>
        + Send
        + Sync,
>;

/// Wrap an async closure as an [`AuthVerifier`].
pub fn verifier<F, Fut>(f: F) -> AuthVerifier
where
    F: Fn(AuthContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Auth, XrpcError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Extract `Basic` credentials from the Authorization header.
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let b64 = header.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(b64.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

/// Extract a `Bearer` token from the Authorization header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("admin:password"))
                .parse()
                .unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("admin".into(), "password".into()))
        );
    }

    #[test]
    fn rejects_malformed_basic_credentials() {
        let mut headers = HeaderMap::new();
        assert_eq!(basic_credentials(&headers), None);

        headers.insert(AUTHORIZATION, "Basic not!base64".parse().unwrap());
        assert_eq!(basic_credentials(&headers), None);

        headers.insert(
            AUTHORIZATION,
            format!("Basic {}", STANDARD.encode("no-colon")).parse().unwrap(),
        );
        assert_eq!(basic_credentials(&headers), None);

        headers.insert(
            AUTHORIZATION,
            format!("Bearer {}", STANDARD.encode("a:b")).parse().unwrap(),
        );
        assert_eq!(basic_credentials(&headers), None);
    }

    #[test]
    fn parses_bearer_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def.ghi"));

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
