// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request body reading, decompression, and decoding
//!
//! Bodies are read with the configured blob limit enforced three times over:
//! against a declared `Content-Length` before reading, against the running
//! total while streaming, and against the inflated size after each
//! content-encoding stage. Decoding follows the actual content type: JSON is
//! parsed and IPLD-rehydrated, `text/*` becomes a string, anything else
//! stays raw bytes.

use std::io::Read;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use http_body_util::BodyExt;
use hyper::body::Body;

use lexicon::{BodySchema, DataValue, Lexicons};

use crate::error::{invalid_input, XrpcError};

const TOO_LARGE: &str = "request entity too large";

/// A decoded request body handed to the handler.
#[derive(Debug)]
pub struct HandlerInput {
    /// The request's normalized content type.
    pub encoding: String,
    pub body: InputBody,
}

#[derive(Debug)]
pub enum InputBody {
    /// JSON, decoded and IPLD-rehydrated.
    Data(DataValue),
    /// A `text/*` body.
    Text(String),
    /// Anything else, verbatim.
    Bytes(Bytes),
}

impl InputBody {
    pub fn as_data(&self) -> Option<&DataValue> {
        match self {
            InputBody::Data(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            InputBody::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Read and decode the request body for a method with the given declared
/// input, or establish that no body was sent.
pub async fn parse_handler_input<B>(
    lexicons: &Lexicons,
    nsid: &str,
    declared: Option<&BodySchema>,
    headers: &HeaderMap,
    body: B,
    blob_limit: u64,
) -> Result<Option<HandlerInput>, XrpcError>
where
    B: Body + Unpin,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let raw = read_with_limit(headers, body, blob_limit).await?;
    let raw = match headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok()) {
        Some(encodings) => decode_content_encoding(&raw, encodings, blob_limit)?,
        None => raw,
    };

    // presence: a non-empty body, or any content-type header at all
    let present = !raw.is_empty() || content_type.is_some();

    let Some(declared) = declared else {
        if present {
            return Err(XrpcError::invalid_request(
                "A request body was provided when none was expected",
            ));
        }
        return Ok(None);
    };

    if !present {
        return Err(XrpcError::invalid_request(
            "A request body is expected but none was provided",
        ));
    }
    let Some(content_type) = content_type else {
        return Err(XrpcError::invalid_request(
            "Request encoding (Content-Type) required but not provided",
        ));
    };

    let mime = normalize_mime(&content_type);
    if !mime_matches(&declared.encoding, &mime) {
        return Err(XrpcError::invalid_request(format!(
            "Wrong request encoding (Content-Type): {mime}"
        )));
    }

    let body = if is_json(&mime) {
        let json: serde_json::Value = serde_json::from_slice(&raw)
            .map_err(|e| XrpcError::invalid_request(format!("Request body is not valid json: {e}")))?;
        let data = DataValue::from_json(&json);
        lexicons
            .assert_valid_xrpc_input(nsid, &data)
            .map_err(invalid_input)?;
        InputBody::Data(data)
    } else if mime.starts_with("text/") {
        let text = String::from_utf8(raw)
            .map_err(|_| XrpcError::invalid_request("Request body is not valid utf-8"))?;
        InputBody::Text(text)
    } else {
        InputBody::Bytes(raw.into())
    };

    Ok(Some(HandlerInput { encoding: mime, body }))
}

/// Read a whole body, rejecting anything past `blob_limit`.
///
/// A `Content-Length` over the limit is rejected before a byte is read;
/// unknown-length bodies are bounded while streaming.
pub async fn read_with_limit<B>(
    headers: &HeaderMap,
    mut body: B,
    blob_limit: u64,
) -> Result<Vec<u8>, XrpcError>
where
    B: Body + Unpin,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let declared_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .or_else(|| body.size_hint().exact());
    if let Some(length) = declared_length {
        if length > blob_limit {
            return Err(XrpcError::payload_too_large(TOO_LARGE));
        }
    }

    let mut buf = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| {
            XrpcError::internal(anyhow::Error::new(e).context("reading request body"))
        })?;
        let Ok(mut data) = frame.into_data() else {
            continue;
        };
        if (buf.len() + data.remaining()) as u64 > blob_limit {
            return Err(XrpcError::payload_too_large(TOO_LARGE));
        }
        let chunk = data.copy_to_bytes(data.remaining());
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.to_vec())
}

/// Undo a `Content-Encoding` chain, outermost (rightmost) stage first.
///
/// `identity` tokens are dropped; anything outside gzip/deflate/br is
/// rejected. The inflated size is checked against the blob limit after every
/// stage so a compression bomb can't expand unchecked.
pub fn decode_content_encoding(
    bytes: &[u8],
    encodings: &str,
    blob_limit: u64,
) -> Result<Vec<u8>, XrpcError> {
    let mut stages = Vec::new();
    for token in encodings.split(',') {
        let token = token.trim().to_ascii_lowercase();
        match token.as_str() {
            "" | "identity" => {}
            "gzip" | "deflate" | "br" => stages.push(token),
            _ => return Err(XrpcError::invalid_request("unsupported content-encoding")),
        }
    }

    let mut data = bytes.to_vec();
    for stage in stages.iter().rev() {
        data = inflate_stage(stage, &data, blob_limit)?;
    }
    Ok(data)
}

fn inflate_stage(stage: &str, data: &[u8], blob_limit: u64) -> Result<Vec<u8>, XrpcError> {
    let mut out = Vec::new();
    let result = match stage {
        "gzip" => flate2::read::GzDecoder::new(data)
            .take(blob_limit + 1)
            .read_to_end(&mut out),
        "deflate" => flate2::read::ZlibDecoder::new(data)
            .take(blob_limit + 1)
            .read_to_end(&mut out),
        "br" => brotli::Decompressor::new(data, 4096)
            .take(blob_limit + 1)
            .read_to_end(&mut out),
        _ => unreachable!("stages are validated before inflating"),
    };
    result.map_err(|_| XrpcError::invalid_request("unable to decode request body"))?;
    if out.len() as u64 > blob_limit {
        return Err(XrpcError::payload_too_large(TOO_LARGE));
    }
    Ok(out)
}

/// Strip parameters and lowercase the base type: `Text/Plain; charset=X` →
/// `text/plain`.
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Whether an actual (normalized) content type satisfies a declared input
/// encoding.
pub fn mime_matches(declared: &str, actual: &str) -> bool {
    let declared = normalize_mime(declared);
    if declared == "*/*" || declared == actual {
        return true;
    }
    // declared json accepts any json-flavored actual subtype
    declared == "application/json" && is_json(actual)
}

pub(crate) fn is_json(mime: &str) -> bool {
    match mime.split_once('/') {
        Some((_, subtype)) => subtype == "json" || subtype.ends_with("+json"),
        None => false,
    }
}
