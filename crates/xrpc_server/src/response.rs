// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response construction helpers

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::Response;
pub use hyper::StatusCode;

use rate_limit::RateLimiterStatus;

use crate::error::XrpcError;

/// Type-erased HTTP response.
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// An empty 200.
pub fn empty() -> GenericResponse {
    Response::new(Empty::new().map_err(anyhow::Error::from).boxed())
}

/// A response with known bytes and content type.
pub fn full(status: StatusCode, content_type: &str, content: impl Into<Bytes>) -> GenericResponse {
    let mut response = Response::new(Full::new(content.into()).map_err(anyhow::Error::from).boxed());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// A plain text response.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content.to_string())
}

/// A JSON response.
pub fn json(status: StatusCode, content: &serde_json::Value) -> GenericResponse {
    // serializing a serde_json::Value can't fail
    full(
        status,
        "application/json; charset=utf-8",
        serde_json::to_vec(content).unwrap(),
    )
}

/// A plain text 404.
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// The wire rendering of an [`XrpcError`].
pub fn error(err: &XrpcError) -> GenericResponse {
    json(err.status(), &err.wire_body())
}

/// Advertise the tightest rate-limit bucket on a response.
pub fn set_rate_limit_headers(response: &mut GenericResponse, status: &RateLimiterStatus) {
    let reset_secs = status.ms_before_next.div_ceil(1000);
    let window_secs = status.duration.as_secs();
    let headers = response.headers_mut();
    let entries = [
        ("ratelimit-limit", status.limit.to_string()),
        ("ratelimit-remaining", status.remaining_points.to_string()),
        ("ratelimit-reset", reset_secs.to_string()),
        ("ratelimit-policy", format!("{};w={window_secs}", status.limit)),
    ];
    for (name, value) in entries {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use futures::executor::block_on;

    fn body_bytes(response: GenericResponse) -> Vec<u8> {
        block_on(response.into_body().collect()).unwrap().to_bytes().to_vec()
    }

    #[test]
    fn error_responses_carry_the_wire_body()  {
        let err = XrpcError::rate_limit_exceeded();
        let response = error(&err);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value = serde_json::from_slice(&body_bytes(response)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"error": "RateLimitExceeded", "message": "Rate Limit Exceeded"})
        );
    }

    #[test]
    fn rate_limit_headers_render_the_quartet() {
        let mut response = empty();
        set_rate_limit_headers(
            &mut response,
            &RateLimiterStatus {
                limit: 5,
                duration: Duration::from_secs(300),
                remaining_points: 2,
                ms_before_next: 1500,
                consumed_points: 3,
                is_first_in_duration: false,
            },
        );
        let headers = response.headers();
        assert_eq!(headers["ratelimit-limit"], "5");
        assert_eq!(headers["ratelimit-remaining"], "2");
        assert_eq!(headers["ratelimit-reset"], "2");
        assert_eq!(headers["ratelimit-policy"], "5;w=300");
    }
}
