// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use lexicon::DataValue;
use xrpc_frame::{Frame, FrameError};

use crate::socket::{self, KeepAliveOpts};

/// Why a subscription ended (other than a clean server close).
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The server sent an error frame; `code` is always -1 on the wire.
    #[error("error frame {name:?}: {message:?}")]
    ErrorFrame {
        name: String,
        message: Option<String>,
    },
    #[error("bad frame: {0}")]
    Frame(#[from] FrameError),
    /// The socket dropped without a close handshake (1006).
    #[error("websocket closed abnormally")]
    AbnormalClose,
    #[error("websocket: {0}")]
    Socket(#[from] WsError),
}

pub struct SubscriptionOpts<C, V> {
    /// The subscription's NSID, used to expand `#`-relative message types.
    pub nsid: String,
    /// Opens a socket for the given attempt number; called again on every
    /// reconnect so URLs and parameters can be recomputed.
    pub connector: C,
    /// Decides whether a tagged message is yielded; `None` skips it.
    pub validate: V,
    pub keep_alive: KeepAliveOpts,
}

/// An async iterator over validated subscription messages.
///
/// Dropping it (or calling [`close`](Subscription::close)) shuts the socket
/// down and stops the driver.
pub struct Subscription<T> {
    messages: mpsc::Receiver<Result<T, SubscriptionError>>,
    close: watch::Sender<bool>,
}

impl<T: Send + 'static> Subscription<T> {
    pub fn open<C, Fut, S, V>(opts: SubscriptionOpts<C, V>) -> Self
    where
        C: FnMut(u32) -> Fut + Send + 'static,
        Fut: Future<Output = Result<WebSocketStream<S>, WsError>> + Send + 'static,
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        V: Fn(DataValue) -> Option<T> + Send + 'static,
    {
        let SubscriptionOpts {
            nsid,
            connector,
            validate,
            keep_alive,
        } = opts;

        let (chunk_tx, mut chunk_rx) = mpsc::channel(16);
        let (close_tx, close_rx) = watch::channel(false);
        tokio::spawn(socket::run(connector, keep_alive, chunk_tx, close_rx));

        let (msg_tx, msg_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let result = match chunk {
                    Ok(bytes) => match Frame::from_bytes(&bytes) {
                        Ok(Frame::Message { t, body }) => {
                            match validate(tag_message(&nsid, t, body)) {
                                Some(message) => Ok(message),
                                None => continue,
                            }
                        }
                        Ok(Frame::Error { error, message }) => {
                            Err(SubscriptionError::ErrorFrame {
                                name: error,
                                message,
                            })
                        }
                        Err(err) => Err(SubscriptionError::Frame(err)),
                    },
                    Err(err) => Err(err),
                };
                let terminal = result.is_err();
                if msg_tx.send(result).await.is_err() || terminal {
                    break;
                }
            }
        });

        Subscription {
            messages: msg_rx,
            close: close_tx,
        }
    }

    /// The next validated message; `None` when the stream ended cleanly.
    pub async fn next(&mut self) -> Option<Result<T, SubscriptionError>> {
        self.messages.recv().await
    }

    /// Close the socket and end the iterator.
    pub fn close(&self) {
        self.close.send_replace(true);
    }
}

/// A connector resolving a URL per attempt via [`connect_async`].
pub fn url_connector<F>(
    mut build_url: F,
) -> impl FnMut(u32) -> BoxFuture<'static, Result<WebSocketStream<MaybeTlsStream<TcpStream>>, WsError>>
       + Send
where
    F: FnMut(u32) -> String + Send + 'static,
{
    move |attempt| {
        let url = build_url(attempt);
        Box::pin(async move { connect_async(url).await.map(|(ws, _response)| ws) })
    }
}

/// Expand a frame's `t` into a full `$type` on the message body.
///
/// `#name` is relative to the subscription NSID; anything else is used
/// verbatim. Non-object bodies can't carry a `$type` and pass through.
fn tag_message(nsid: &str, t: Option<String>, body: DataValue) -> DataValue {
    let Some(t) = t else {
        return body;
    };
    let full_type = if t.starts_with('#') {
        format!("{nsid}{t}")
    } else {
        t
    };
    match body {
        DataValue::Object(mut map) => {
            map.insert("$type".to_owned(), DataValue::String(full_type));
            DataValue::Object(map)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(json: serde_json::Value) -> DataValue {
        DataValue::from_json(&json)
    }

    #[test]
    fn relative_types_expand_to_the_nsid() {
        let tagged = tag_message(
            "io.example.stream",
            Some("#commit".into()),
            obj(serde_json::json!({"seq": 1})),
        );
        assert_eq!(
            tagged,
            obj(serde_json::json!({"$type": "io.example.stream#commit", "seq": 1}))
        );
    }

    #[test]
    fn absolute_types_pass_verbatim() {
        let tagged = tag_message(
            "io.example.stream",
            Some("io.example.other#thing".into()),
            obj(serde_json::json!({"seq": 2})),
        );
        assert_eq!(
            tagged,
            obj(serde_json::json!({"$type": "io.example.other#thing", "seq": 2}))
        );
    }

    #[test]
    fn untagged_and_non_object_bodies_are_untouched() {
        let body = obj(serde_json::json!({"seq": 3}));
        assert_eq!(tag_message("io.example.stream", None, body.clone()), body);

        let scalar = DataValue::Integer(7);
        assert_eq!(
            tag_message("io.example.stream", Some("#x".into()), scalar.clone()),
            scalar
        );
    }

    #[tokio::test]
    async fn iterates_messages_until_clean_close() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        // a one-shot server: three messages, then a clean close
        tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            for i in 0..3 {
                let frame = Frame::message(
                    Some("#count".into()),
                    obj(serde_json::json!({"count": i})),
                );
                ws.send(Message::Binary(frame.to_bytes())).await.unwrap();
            }
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut client_io = Some(client_io);
        let subscription = Subscription::open(SubscriptionOpts {
            nsid: "io.example.stream".to_owned(),
            connector: move |_attempt| {
                let io = client_io.take();
                async move {
                    match io {
                        Some(io) => tokio_tungstenite::client_async("ws://test/xrpc/io.example.stream", io)
                            .await
                            .map(|(ws, _)| ws),
                        None => Err(WsError::ConnectionClosed),
                    }
                }
            },
            validate: |value: DataValue| {
                let map = value.as_object()?;
                match map.get("count") {
                    Some(DataValue::Integer(count)) => Some(*count),
                    _ => None,
                }
            },
            keep_alive: KeepAliveOpts::default(),
        });

        let mut subscription = subscription;
        let mut seen = Vec::new();
        while let Some(message) = subscription.next().await {
            seen.push(message.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn error_frames_terminate_with_a_typed_error() {
        use futures::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(server_io).await.unwrap();
            let frame = Frame::error("InvalidRequest", Some("bad params".into()));
            ws.send(Message::Binary(frame.to_bytes())).await.unwrap();
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut client_io = Some(client_io);
        let mut subscription: Subscription<i64> = Subscription::open(SubscriptionOpts {
            nsid: "io.example.stream".to_owned(),
            connector: move |_attempt| {
                let io = client_io.take();
                async move {
                    match io {
                        Some(io) => tokio_tungstenite::client_async("ws://test/xrpc/io.example.stream", io)
                            .await
                            .map(|(ws, _)| ws),
                        None => Err(WsError::ConnectionClosed),
                    }
                }
            },
            validate: |_| None,
            keep_alive: KeepAliveOpts::default(),
        });

        match subscription.next().await {
            Some(Err(SubscriptionError::ErrorFrame { name, message })) => {
                assert_eq!(name, "InvalidRequest");
                assert_eq!(message.as_deref(), Some("bad params"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(subscription.next().await.is_none());
    }
}
