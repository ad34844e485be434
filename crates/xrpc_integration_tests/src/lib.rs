// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared scaffolding for the end-to-end tests: the scenario lexicons and a
//! harness serving an [`XrpcServer`] over an in-memory network.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Request, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::io::DuplexStream;
use tokio_tungstenite::WebSocketStream;

use lexicon::{
    BodySchema, Lexicons, MethodDef, ObjectSchema, ParamType, ParamsSchema, ProcedureDef,
    PropType, QueryDef, SubscriptionDef,
};
use xrpc_server::test::TestNet;
use xrpc_server::{Server, XrpcServer};

pub type RequestBody = BoxBody<Bytes, Infallible>;

/// The method definitions the scenarios run against.
pub fn scenario_lexicons() -> Lexicons {
    let mut lex = Lexicons::new();
    lex.add(
        "io.example.pingOne",
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
        "io.example.pingFour",
        MethodDef::Procedure(ProcedureDef {
            input: Some(BodySchema::json(
                ObjectSchema::default()
                    .property("message", PropType::String)
                    .require("message"),
            )),
            output: Some(BodySchema::json(
                ObjectSchema::default()
                    .property("message", PropType::String)
                    .require("message"),
            )),
            ..Default::default()
        }),
    )
    .unwrap();
    lex.add(
        "io.example.ipld",
        MethodDef::Procedure(ProcedureDef {
            input: Some(BodySchema::json(
                ObjectSchema::default()
                    .property("cid", PropType::CidLink)
                    .property("bytes", PropType::Bytes)
                    .require("cid")
                    .require("bytes"),
            )),
            output: Some(BodySchema::encoding("application/json")),
            ..Default::default()
        }),
    )
    .unwrap();
    lex.add(
        "io.example.streamOne",
        MethodDef::Subscription(SubscriptionDef {
            parameters: Some(
                ParamsSchema::default()
                    .property("countdown", ParamType::Integer)
                    .require("countdown"),
            ),
            ..Default::default()
        }),
    )
    .unwrap();
    lex.add(
        "io.example.blobTest",
        MethodDef::Procedure(ProcedureDef {
            input: Some(BodySchema::encoding("*/*")),
            output: Some(BodySchema::encoding("application/json")),
            ..Default::default()
        }),
    )
    .unwrap();
    lex.add(
        "io.example.protected",
        MethodDef::Procedure(ProcedureDef {
            input: Some(BodySchema::json(
                ObjectSchema::default()
                    .property("original", PropType::String)
                    .require("original"),
            )),
            output: Some(BodySchema::encoding("application/json")),
            ..Default::default()
        }),
    )
    .unwrap();
    lex.add(
        "io.example.limited",
        MethodDef::Query(QueryDef {
            output: Some(BodySchema::encoding("application/json")),
            ..Default::default()
        }),
    )
    .unwrap();
    lex
}

/// An engine served over in-memory connections.
pub struct Harness {
    net: TestNet,
}

impl Harness {
    pub fn start(xrpc: XrpcServer) -> Harness {
        let (net, connections) = TestNet::new();
        tokio::spawn(async move {
            Server::new(64).serve(connections, Arc::new(xrpc)).await;
        });
        Harness { net }
    }

    /// Send one request over a fresh connection.
    pub async fn send(&self, request: Request<RequestBody>) -> (StatusCode, HeaderMap, Bytes) {
        let io = self.net.connect();
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .expect("handshake");
        tokio::spawn(connection);
        let response = sender.send_request(request).await.expect("send request");
        let (parts, body) = response.into_parts();
        let body = body.collect().await.expect("read response body").to_bytes();
        (parts.status, parts.headers, body)
    }

    /// Open a WebSocket against the server.
    pub async fn ws(&self, path_and_query: &str) -> WebSocketStream<DuplexStream> {
        let io = self.net.connect();
        let (ws, _response) =
            tokio_tungstenite::client_async(format!("ws://test{path_and_query}"), io)
                .await
                .expect("websocket handshake");
        ws
    }

    /// A raw connection, for driving the client crate's subscription.
    pub fn connect(&self) -> DuplexStream {
        self.net.connect()
    }
}

pub fn get(path: &str) -> Request<RequestBody> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header("host", "test")
        .body(Full::new(Bytes::new()).boxed())
        .unwrap()
}

pub fn post(path: &str, content_type: &str, body: impl Into<Bytes>) -> Request<RequestBody> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("host", "test")
        .header("content-type", content_type)
        .body(Full::new(body.into()).boxed())
        .unwrap()
}

/// Parse a JSON response body.
pub fn json_body(body: &Bytes) -> serde_json::Value {
    serde_json::from_slice(body).expect("response body is json")
}
