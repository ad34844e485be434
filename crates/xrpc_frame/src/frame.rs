// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use lexicon::DataValue;
use minicbor::{Decoder, Encoder};

use crate::value;

const OP_MESSAGE: i64 = 1;
const OP_ERROR: i64 = -1;

/// One subscription frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A message, optionally discriminated by a `#name` type tag.
    Message { t: Option<String>, body: DataValue },
    /// A terminal error; the server closes the stream after sending one.
    Error {
        error: String,
        message: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Missing frame body")]
    MissingBody,
    #[error("Too many CBOR data items in frame")]
    TooManyItems,
    #[error("Invalid frame header")]
    InvalidHeader,
    #[error("Invalid error frame body")]
    InvalidErrorBody,
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

impl Frame {
    pub fn message(t: Option<String>, body: DataValue) -> Self {
        Frame::Message { t, body }
    }

    pub fn error(error: impl Into<String>, message: Option<String>) -> Self {
        Frame::Error {
            error: error.into(),
            message,
        }
    }

    /// Serialize as two concatenated CBOR items: header, then body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        // encoding to a Vec can't fail
        match self {
            Frame::Message { t, body } => {
                match t {
                    Some(t) => {
                        enc.map(2).unwrap();
                        enc.str("op").unwrap().i64(OP_MESSAGE).unwrap();
                        enc.str("t").unwrap().str(t).unwrap();
                    }
                    None => {
                        enc.map(1).unwrap();
                        enc.str("op").unwrap().i64(OP_MESSAGE).unwrap();
                    }
                }
                value::encode(body, &mut enc).unwrap();
            }
            Frame::Error { error, message } => {
                enc.map(1).unwrap();
                enc.str("op").unwrap().i64(OP_ERROR).unwrap();
                match message {
                    Some(message) => {
                        enc.map(2).unwrap();
                        enc.str("error").unwrap().str(error).unwrap();
                        enc.str("message").unwrap().str(message).unwrap();
                    }
                    None => {
                        enc.map(1).unwrap();
                        enc.str("error").unwrap().str(error).unwrap();
                    }
                }
            }
        }
        buf
    }

    /// Parse a binary WebSocket message into a frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut dec = Decoder::new(bytes);

        let header = value::decode(&mut dec)?;
        match dec.datatype() {
            Err(e) if e.is_end_of_input() => return Err(FrameError::MissingBody),
            _ => {}
        }
        let body = value::decode(&mut dec)?;
        if dec.datatype().is_ok() {
            return Err(FrameError::TooManyItems);
        }

        let header = header.as_object().ok_or(FrameError::InvalidHeader)?;
        let op = match header.get("op") {
            Some(DataValue::Integer(op)) => *op,
            _ => return Err(FrameError::InvalidHeader),
        };
        match op {
            OP_MESSAGE => {
                let t = match header.get("t") {
                    None | Some(DataValue::Null) => None,
                    Some(DataValue::String(t)) => Some(t.clone()),
                    Some(_) => return Err(FrameError::InvalidHeader),
                };
                Ok(Frame::Message { t, body })
            }
            OP_ERROR => {
                let body = body.as_object().ok_or(FrameError::InvalidErrorBody)?;
                let error = match body.get("error") {
                    Some(DataValue::String(error)) => error.clone(),
                    _ => return Err(FrameError::InvalidErrorBody),
                };
                let message = match body.get("message") {
                    None | Some(DataValue::Null) => None,
                    Some(DataValue::String(message)) => Some(message.clone()),
                    Some(_) => return Err(FrameError::InvalidErrorBody),
                };
                Ok(Frame::Error { error, message })
            }
            _ => Err(FrameError::InvalidHeader),
        }
    }
}
