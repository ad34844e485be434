// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The keep-alive WebSocket underneath a subscription
//!
//! Runs as a driver task pushing binary chunks to the consumer. The loop:
//! connect (recomputing the socket via the caller's connector, so
//! parameters refresh per attempt), reset the backoff counter on open,
//! heartbeat with protocol pings, and on a reconnectable failure re-enter
//! with exponential backoff and jitter. Clean closes end the stream;
//! anything non-reconnectable is surfaced and ends it too.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::subscription::SubscriptionError;

#[derive(Debug, Clone)]
pub struct KeepAliveOpts {
    /// Ceiling on the reconnect backoff.
    pub max_reconnect: Duration,
    /// Protocol-ping cadence; a tick without a pong closes the socket.
    pub heartbeat_interval: Duration,
}

impl Default for KeepAliveOpts {
    fn default() -> Self {
        Self {
            max_reconnect: Duration::from_secs(64),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Whether a socket failure is worth a reconnect: the network-shaped error
/// kinds, plus the abnormal-close sentinel.
pub fn reconnectable(err: &SubscriptionError) -> bool {
    use std::io::ErrorKind;
    match err {
        SubscriptionError::AbnormalClose => true,
        SubscriptionError::Socket(WsError::Io(io)) => matches!(
            io.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
        ),
        SubscriptionError::Socket(WsError::Protocol(_)) => true,
        _ => false,
    }
}

/// Waits until `rx` reports `true`, without holding a non-`Send` watch
/// guard across an `.await` (which `Receiver::wait_for` does internally).
async fn wait_for_true(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// `min(max_reconnect, 1s · (2^n + jitter))`, jitter ∈ [-0.5, 0.5).
fn backoff(n: u32, max_reconnect: Duration) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(-0.5..0.5);
    let secs = (2f64.powi(n.min(30) as i32) + jitter).max(0.0);
    Duration::from_secs_f64(secs).min(max_reconnect)
}

/// Drive the socket until it ends or `closed` fires, feeding binary chunks
/// into `chunks`.
pub(crate) async fn run<C, Fut, S>(
    mut connector: C,
    opts: KeepAliveOpts,
    chunks: mpsc::Sender<Result<Vec<u8>, SubscriptionError>>,
    mut closed: watch::Receiver<bool>,
) where
    C: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<WebSocketStream<S>, WsError>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut attempt: u32 = 0;
    let mut reconnects: u32 = 0;
    'reconnect: loop {
        if reconnects > 0 {
            sleep(backoff(reconnects - 1, opts.max_reconnect)).await;
        }

        let mut ws = match connector(attempt).await {
            Ok(ws) => ws,
            Err(err) => {
                let err = SubscriptionError::Socket(err);
                if reconnectable(&err) {
                    debug!("connect failed, retrying: {err}");
                    attempt += 1;
                    reconnects += 1;
                    continue 'reconnect;
                }
                let _ = chunks.send(Err(err)).await;
                return;
            }
        };
        attempt += 1;
        reconnects = 0;

        let mut heartbeat = interval(opts.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset();
        // the socket just opened, so it has proven itself alive
        let mut alive = true;

        loop {
            tokio::select! {
                _ = wait_for_true(&mut closed) => {
                    let _ = ws.close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: CloseCode::Normal,
                        reason: "".into(),
                    })).await;
                    return;
                }
                _ = heartbeat.tick() => {
                    if !alive {
                        // peer stopped answering; force a reconnect
                        warn!("no pong since last heartbeat, closing socket");
                        let _ = ws.close(None).await;
                        reconnects += 1;
                        continue 'reconnect;
                    }
                    alive = false;
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        reconnects += 1;
                        continue 'reconnect;
                    }
                }
                incoming = ws.next() => match incoming {
                    Some(Ok(Message::Binary(chunk))) => {
                        if chunks.send(Ok(chunk)).await.is_err() {
                            // consumer dropped the subscription
                            let _ = ws.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => alive = true,
                    Some(Ok(Message::Close(frame))) => {
                        match frame {
                            Some(frame) if frame.code == CloseCode::Abnormal => {
                                reconnects += 1;
                                continue 'reconnect;
                            }
                            // a clean close ends the stream
                            _ => return,
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let err = SubscriptionError::Socket(err);
                        if reconnectable(&err) {
                            debug!("socket error, retrying: {err}");
                            reconnects += 1;
                            continue 'reconnect;
                        }
                        let _ = chunks.send(Err(err)).await;
                        return;
                    }
                    // dropped without a close handshake: the 1006 case
                    None => {
                        reconnects += 1;
                        continue 'reconnect;
                    }
                },
            }
        }
    }
}
