// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The dynamic data value bodies are decoded into
//!
//! JSON bodies are decoded to [`DataValue`] through [`DataValue::from_json`],
//! which rehydrates the two IPLD interop forms: `{"$link": "<cid>"}` becomes
//! [`DataValue::CidLink`] and `{"$bytes": "<base64>"}` becomes
//! [`DataValue::Bytes`]. [`DataValue::to_json`] is the inverse projection and
//! is what response serialization uses, so IPLD values survive a round trip
//! through a handler untouched.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;

/// A content identifier, carried as its canonical string form.
///
/// The engine treats CIDs as opaque: two links are equal when their string
/// forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CidLink(String);

impl CidLink {
    pub fn new(cid: impl Into<String>) -> Self {
        Self(cid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CidLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded request or response body, or one subscription message.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    CidLink(CidLink),
    Array(Vec<DataValue>),
    Object(BTreeMap<String, DataValue>),
}

impl DataValue {
    /// Decode a JSON value, rehydrating `$link` and `$bytes` objects.
    ///
    /// A `$link`/`$bytes` object only counts as the IPLD form when it has
    /// exactly that one key with a string value; anything else stays a plain
    /// object.
    pub fn from_json(json: &serde_json::Value) -> DataValue {
        match json {
            serde_json::Value::Null => DataValue::Null,
            serde_json::Value::Bool(b) => DataValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DataValue::Integer(i),
                None => DataValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => DataValue::String(s.clone()),
            serde_json::Value::Array(items) => {
                DataValue::Array(items.iter().map(DataValue::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(serde_json::Value::String(cid)) = map.get("$link") {
                        return DataValue::CidLink(CidLink::new(cid.clone()));
                    }
                    if let Some(serde_json::Value::String(b64)) = map.get("$bytes") {
                        if let Ok(bytes) = STANDARD_NO_PAD.decode(b64.trim_end_matches('=')) {
                            return DataValue::Bytes(bytes);
                        }
                    }
                }
                DataValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), DataValue::from_json(v)))
                        .collect(),
                )
            }
        }
    }

    /// Project back to JSON, emitting the `$link`/`$bytes` interop forms.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::Null => serde_json::Value::Null,
            DataValue::Bool(b) => serde_json::Value::Bool(*b),
            DataValue::Integer(i) => serde_json::Value::from(*i),
            DataValue::Float(f) => serde_json::Value::from(*f),
            DataValue::String(s) => serde_json::Value::String(s.clone()),
            DataValue::Bytes(bytes) => {
                serde_json::json!({ "$bytes": STANDARD_NO_PAD.encode(bytes) })
            }
            DataValue::CidLink(cid) => serde_json::json!({ "$link": cid.as_str() }),
            DataValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(DataValue::to_json).collect())
            }
            DataValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, DataValue>> {
        match self {
            DataValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convenience for building object values in handlers and tests.
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, DataValue)>) -> DataValue {
        DataValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.to_owned())
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Integer(i)
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Bool(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rehydrates_links_and_bytes() {
        let json = serde_json::json!({
            "cid": { "$link": "bafyreidfayvfuwqa7qlnopdjiqrxzs6blmoeu4rujcjtnci5beludirz2a" },
            "data": { "$bytes": "AAECAw" },
        });
        let value = DataValue::from_json(&json);
        let map = value.as_object().unwrap();
        assert_eq!(
            map["cid"],
            DataValue::CidLink(CidLink::new(
                "bafyreidfayvfuwqa7qlnopdjiqrxzs6blmoeu4rujcjtnci5beludirz2a"
            ))
        );
        assert_eq!(map["data"], DataValue::Bytes(vec![0, 1, 2, 3]));

        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn multi_key_objects_stay_plain() {
        let json = serde_json::json!({ "$link": "bafy", "other": 1 });
        let value = DataValue::from_json(&json);
        assert!(matches!(value, DataValue::Object(_)));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn numbers_split_into_integer_and_float() {
        assert_eq!(
            DataValue::from_json(&serde_json::json!(42)),
            DataValue::Integer(42)
        );
        assert_eq!(
            DataValue::from_json(&serde_json::json!(1.5)),
            DataValue::Float(1.5)
        );
    }

    #[test]
    fn padded_base64_is_accepted() {
        let json = serde_json::json!({ "$bytes": "AAECAw==" });
        assert_eq!(DataValue::from_json(&json), DataValue::Bytes(vec![0, 1, 2, 3]));
    }
}
