// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The subscription stream server
//!
//! A subscription request upgrades to WebSocket, then runs auth and
//! parameter validation *on the socket*: failures there are reported as a
//! single error frame followed by a policy close (1008), since by that point
//! there is no HTTP response left to send. A healthy connection drives the
//! handler's message stream to frames until it ends (normal close, 1000),
//! it yields an error (error frame, policy close), or the client goes away
//! (stop signal flipped, producer dropped).

use std::sync::Arc;

use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Body;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use lexicon::{DataValue, Lexicons, MethodDef};
use xrpc_frame::Frame;

use crate::auth::{AuthContext, AuthVerifier};
use crate::error::XrpcError;
use crate::params::decode_query_params;
use crate::response::GenericResponse;
use crate::routes::{StopSignal, StreamContext, StreamHandler, StreamItem, StreamRouteConfig};

pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Accept the upgrade, spawn the connection task, and return the 101.
pub(crate) fn handle_upgrade<B>(
    lexicons: Arc<Lexicons>,
    nsid: String,
    config: &StreamRouteConfig,
    mut req: Request<B>,
) -> GenericResponse
where
    B: Body + Send + 'static,
{
    let Some(key) = req.headers().get(SEC_WEBSOCKET_KEY) else {
        return crate::response::error(&XrpcError::invalid_request(
            "missing Sec-WebSocket-Key header",
        ));
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut req);
    let headers = req.headers().clone();
    let query = req.uri().query().map(str::to_owned);
    let auth = config.auth.clone();
    let handler = config.handler.clone();

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
                run_connection(ws, lexicons, nsid, auth, handler, headers, query).await;
            }
            Err(err) => warn!("websocket upgrade failed: {err}"),
        }
    });

    // the builder only sees statically valid parts
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .body(Empty::new().map_err(anyhow::Error::from).boxed())
        .unwrap()
}

async fn run_connection<S>(
    ws: WebSocketStream<S>,
    lexicons: Arc<Lexicons>,
    nsid: String,
    auth: Option<AuthVerifier>,
    handler: StreamHandler,
    headers: HeaderMap,
    query: Option<String>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let (mut sink, mut source) = ws.split();

    let auth = match &auth {
        Some(verifier) => {
            let ctx = AuthContext {
                headers: headers.clone(),
                nsid: nsid.clone(),
            };
            match verifier(ctx).await {
                Ok(auth) => Some(auth),
                Err(err) => {
                    send_terminal_error(&mut sink, &nsid, &err).await;
                    return;
                }
            }
        }
        None => None,
    };

    let params = decode_query_params(
        query.as_deref(),
        lexicons.get(&nsid).and_then(MethodDef::parameters),
    );
    if let Err(err) = lexicons.assert_valid_xrpc_params(&nsid, &params) {
        // the wire reports the stringified validation failure
        let err = XrpcError::invalid_request(format!("Error: {err}"));
        send_terminal_error(&mut sink, &nsid, &err).await;
        return;
    }

    let ctx = StreamContext {
        nsid: nsid.clone(),
        params,
        headers,
        auth,
        stop: StopSignal(stop_rx),
    };
    let mut messages = match handler(ctx).await {
        Ok(messages) => messages,
        Err(err) => {
            send_terminal_error(&mut sink, &nsid, &err).await;
            return;
        }
    };

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                // client went away (or spoke garbage); tear down the producer
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
            },
            item = messages.next() => match item {
                None => {
                    let close = CloseFrame { code: CloseCode::Normal, reason: "".into() };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
                Some(Ok(item)) => {
                    let frame = frame_from_item(&nsid, item);
                    let error_name = match &frame {
                        Frame::Error { error, .. } => Some(error.clone()),
                        Frame::Message { .. } => None,
                    };
                    if sink.send(Message::Binary(frame.to_bytes())).await.is_err() {
                        break;
                    }
                    if let Some(reason) = error_name {
                        let close = CloseFrame { code: CloseCode::Policy, reason: reason.into() };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        break;
                    }
                }
                Some(Err(err)) => {
                    send_terminal_error(&mut sink, &nsid, &err).await;
                    break;
                }
            },
        }
    }

    // flip the signal and drop the stream so producer cleanup runs before
    // the socket halves do
    stop_tx.send_replace(true);
    drop(messages);
}

/// Report a failure as exactly one error frame, then close with policy code.
async fn send_terminal_error<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    nsid: &str,
    err: &XrpcError,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if err.status().is_server_error() {
        error!("stream error in {nsid}: {}", err.log_message());
    } else {
        debug!("stream rejected {nsid}: {}: {}", err.wire_name(), err.wire_message());
    }
    let frame = Frame::error(err.wire_name(), Some(err.wire_message().to_owned()));
    if sink.send(Message::Binary(frame.to_bytes())).await.is_ok() {
        let close = CloseFrame {
            code: CloseCode::Policy,
            reason: err.wire_name().to_owned().into(),
        };
        let _ = sink.send(Message::Close(Some(close))).await;
    }
}

/// Frame one yielded value, applying the `$type` rewrite rules.
fn frame_from_item(nsid: &str, item: StreamItem) -> Frame {
    let value = match item {
        StreamItem::Frame(frame) => return frame,
        StreamItem::Value(value) => value,
    };
    match value {
        DataValue::Object(mut map) => match map.remove("$type") {
            Some(DataValue::String(t)) => {
                // "<nsid>#name" on our own stream collapses to "#name";
                // foreign types pass through unchanged
                let t = match t.strip_prefix(nsid) {
                    Some(rest) if rest.starts_with('#') => rest.to_owned(),
                    _ => t,
                };
                Frame::message(Some(t), DataValue::Object(map))
            }
            Some(other) => {
                // non-string $type: keep the body intact, no discriminator
                map.insert("$type".to_owned(), other);
                Frame::message(None, DataValue::Object(map))
            }
            None => Frame::message(None, DataValue::Object(map)),
        },
        other => Frame::message(None, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: serde_json::Value) -> DataValue {
        DataValue::from_json(&json)
    }

    #[test]
    fn own_nsid_types_collapse_to_fragment() {
        let frame = frame_from_item(
            "io.example.stream",
            StreamItem::Value(obj(serde_json::json!({
                "$type": "io.example.stream#commit",
                "seq": 1,
            }))),
        );
        assert_eq!(
            frame,
            Frame::message(Some("#commit".into()), obj(serde_json::json!({"seq": 1})))
        );
    }

    #[test]
    fn bare_fragments_pass_through() {
        let frame = frame_from_item(
            "io.example.stream",
            StreamItem::Value(obj(serde_json::json!({"$type": "#commit", "seq": 2}))),
        );
        assert_eq!(
            frame,
            Frame::message(Some("#commit".into()), obj(serde_json::json!({"seq": 2})))
        );
    }

    #[test]
    fn foreign_types_are_kept_verbatim() {
        let frame = frame_from_item(
            "io.example.stream",
            StreamItem::Value(obj(serde_json::json!({
                "$type": "io.example.other#thing",
                "seq": 3,
            }))),
        );
        assert_eq!(
            frame,
            Frame::message(
                Some("io.example.other#thing".into()),
                obj(serde_json::json!({"seq": 3}))
            )
        );
    }

    #[test]
    fn non_string_type_and_non_objects_get_no_discriminator() {
        let frame = frame_from_item(
            "io.example.stream",
            StreamItem::Value(obj(serde_json::json!({"$type": 7, "seq": 4}))),
        );
        assert_eq!(
            frame,
            Frame::message(None, obj(serde_json::json!({"$type": 7, "seq": 4})))
        );

        let frame = frame_from_item("io.example.stream", StreamItem::Value(obj(serde_json::json!(42))));
        assert_eq!(frame, Frame::message(None, DataValue::Integer(42)));
    }

    #[test]
    fn prebuilt_frames_are_untouched() {
        let original = Frame::error("OhNo", Some("bad".into()));
        let frame = frame_from_item("io.example.stream", StreamItem::Frame(original.clone()));
        assert_eq!(frame, original);
    }
}
