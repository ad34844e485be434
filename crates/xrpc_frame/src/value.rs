// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR codec for [`DataValue`]
//!
//! Encoding is definite-length throughout (maps in key order, since object
//! values are ordered maps), bytes are major type 2, and cid-links are tag 42
//! around the CID string. Indefinite-length items and unknown tags are
//! rejected on decode; frames are expected to be canonical.

use std::collections::BTreeMap;

use lexicon::{CidLink, DataValue};
use minicbor::data::{Tag, Type};
use minicbor::{Decoder, Encoder};

const CID_TAG: u64 = 42;

type EncodeError = minicbor::encode::Error<std::convert::Infallible>;

pub fn encode(value: &DataValue, enc: &mut Encoder<&mut Vec<u8>>) -> Result<(), EncodeError> {
    match value {
        DataValue::Null => {
            enc.null()?;
        }
        DataValue::Bool(b) => {
            enc.bool(*b)?;
        }
        DataValue::Integer(i) => {
            enc.i64(*i)?;
        }
        DataValue::Float(f) => {
            enc.f64(*f)?;
        }
        DataValue::String(s) => {
            enc.str(s)?;
        }
        DataValue::Bytes(bytes) => {
            enc.bytes(bytes)?;
        }
        DataValue::CidLink(cid) => {
            enc.tag(Tag::new(CID_TAG))?.str(cid.as_str())?;
        }
        DataValue::Array(items) => {
            enc.array(items.len() as u64)?;
            for item in items {
                encode(item, enc)?;
            }
        }
        DataValue::Object(map) => {
            enc.map(map.len() as u64)?;
            for (key, item) in map {
                enc.str(key)?;
                encode(item, enc)?;
            }
        }
    }
    Ok(())
}

/// Encode a value to a fresh buffer.
pub fn to_vec(value: &DataValue) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    // encoding to a Vec can't fail
    encode(value, &mut enc).unwrap();
    buf
}

pub fn decode(dec: &mut Decoder) -> Result<DataValue, minicbor::decode::Error> {
    match dec.datatype()? {
        Type::Null => {
            dec.null()?;
            Ok(DataValue::Null)
        }
        Type::Undefined => {
            dec.undefined()?;
            Ok(DataValue::Null)
        }
        Type::Bool => Ok(DataValue::Bool(dec.bool()?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 | Type::I8 | Type::I16 | Type::I32
        | Type::I64 | Type::Int => {
            let int = dec.int()?;
            let int = i64::try_from(int)
                .map_err(|_| minicbor::decode::Error::message("integer out of i64 range"))?;
            Ok(DataValue::Integer(int))
        }
        Type::F16 | Type::F32 | Type::F64 => Ok(DataValue::Float(dec.f64()?)),
        Type::Bytes => Ok(DataValue::Bytes(dec.bytes()?.to_vec())),
        Type::String => Ok(DataValue::String(dec.str()?.to_owned())),
        Type::Array => {
            let len = dec
                .array()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite-length array"))?;
            let mut items = Vec::with_capacity(len.min(1024) as usize);
            for _ in 0..len {
                items.push(decode(dec)?);
            }
            Ok(DataValue::Array(items))
        }
        Type::Map => {
            let len = dec
                .map()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite-length map"))?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key = dec.str()?.to_owned();
                map.insert(key, decode(dec)?);
            }
            Ok(DataValue::Object(map))
        }
        Type::Tag => {
            let tag = dec.tag()?;
            if tag != Tag::new(CID_TAG) {
                return Err(minicbor::decode::Error::message("unsupported cbor tag"));
            }
            Ok(DataValue::CidLink(CidLink::new(dec.str()?.to_owned())))
        }
        other => Err(minicbor::decode::Error::message(format!(
            "unsupported cbor type {other}"
        ))),
    }
}

/// Decode a single value from a complete buffer, rejecting trailing bytes.
pub fn from_slice(bytes: &[u8]) -> Result<DataValue, minicbor::decode::Error> {
    let mut dec = Decoder::new(bytes);
    let value = decode(&mut dec)?;
    if dec.datatype().is_ok() {
        return Err(minicbor::decode::Error::message("trailing bytes after value"));
    }
    Ok(value)
}
