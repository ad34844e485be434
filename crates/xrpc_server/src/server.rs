// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A minimal connection-serving loop
//!
//! The dispatch engine doesn't care where connections come from; anything
//! that yields `AsyncRead + AsyncWrite` streams (a TCP listener, a duplex
//! pair in tests) can be served. Each connection runs in its own task with
//! HTTP/1 upgrades enabled so subscriptions can switch to WebSocket, and a
//! watch channel coordinates graceful shutdown: long-lived streams drain,
//! new connections stop being accepted.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::dispatch::XrpcServer;

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

/// Serves connections against one [`XrpcServer`].
pub struct Server {
    connection_permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` bounds simultaneous connections; beyond it, new
    /// connections are dropped with a warning.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connection_permits: Arc::new(Semaphore::new(max_connections)),
            shutdown,
        }
    }

    /// Serve `connections` until the stream ends or
    /// [`graceful_shutdown`](Self::graceful_shutdown) is called, then drain
    /// in-flight connections.
    pub async fn serve<P, C>(&self, connections: P, xrpc: Arc<XrpcServer>)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut tasks = JoinSet::new();
        let mut connections = pin!(connections);

        info!("started serving");
        loop {
            let accepted = tokio::select! {
                biased; // never accept a connection once shut down
                _ = shutdown_rx.wait_for(|&done| done) => break,
                accepted = connections.next() => match accepted {
                    Some(accepted) => accepted,
                    None => break,
                },
            };
            let (connection, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("couldn't accept connection: {err}");
                    continue;
                }
            };
            let Ok(permit) = self.connection_permits.clone().try_acquire_owned() else {
                warn!("connection limit reached; dropping {peer}");
                continue;
            };

            let xrpc = xrpc.clone();
            let mut conn_shutdown = self.shutdown.subscribe();
            let span = info_span!("connection", addr = %peer);
            tasks.spawn(
                async move {
                    let _permit = permit;
                    let service = service_fn(move |request| {
                        let xrpc = xrpc.clone();
                        async move {
                            info!("{} {}", request.method(), request.uri());
                            let response = xrpc.respond(request).await;
                            info!("-> {}", response.status());
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let connection = http1::Builder::new()
                        .serve_connection(TokioIo::new(connection), service)
                        .with_upgrades();
                    let mut connection = pin!(connection);
                    tokio::select! {
                        result = connection.as_mut() => {
                            if let Err(err) = result {
                                warn!("error serving connection: {err}");
                            }
                        }
                        _ = wait_for_true(&mut conn_shutdown) => {
                            connection.as_mut().graceful_shutdown();
                            if let Err(err) = connection.as_mut().await {
                                warn!("error finishing connection: {err}");
                            }
                        }
                    }
                }
                .instrument(span),
            );
        }

        while tasks.join_next().await.is_some() {}
        info!("stopped serving");
    }

    /// Stop accepting connections; current [`serve`](Self::serve) calls
    /// drain their in-flight connections before returning.
    pub fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
