// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Query-string decoding into typed parameters

use lexicon::{ParamType, ParamValue, Params, ParamsSchema};

/// Decode a raw query string against a parameter schema.
///
/// Only declared parameters are decoded; absent ones are omitted. For array
/// parameters every occurrence of the key is collected (a single scalar
/// decodes as a one-element array); for everything else the first occurrence
/// wins. Schema validation is the caller's next step.
pub fn decode_query_params(query: Option<&str>, schema: Option<&ParamsSchema>) -> Params {
    let mut params = Params::new();
    let Some(schema) = schema else {
        return params;
    };
    let query = query.unwrap_or("");
    let pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    for (name, ty) in &schema.properties {
        let mut values = pairs.iter().filter(|(k, _)| k == name).map(|(_, v)| v);
        match ty {
            ParamType::Array(item) => {
                let items: Vec<ParamValue> = values.map(|v| decode_primitive(item, v)).collect();
                if !items.is_empty() {
                    params.insert(name.clone(), ParamValue::Array(items));
                }
            }
            _ => {
                if let Some(value) = values.next() {
                    params.insert(name.clone(), decode_primitive(ty, value));
                }
            }
        }
    }
    params
}

fn decode_primitive(ty: &ParamType, value: &str) -> ParamValue {
    match ty {
        ParamType::String | ParamType::Datetime => ParamValue::String(value.to_owned()),
        ParamType::Integer => ParamValue::Integer(value.parse().unwrap_or(0)),
        ParamType::Float => ParamValue::Float(value.parse().unwrap_or(f64::NAN)),
        ParamType::Boolean => ParamValue::Boolean(value == "true"),
        // nested arrays aren't declarable; treat as the item type
        ParamType::Array(item) => decode_primitive(item, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ParamsSchema {
        ParamsSchema::default()
            .property("message", ParamType::String)
            .property("count", ParamType::Integer)
            .property("ratio", ParamType::Float)
            .property("flag", ParamType::Boolean)
            .property("at", ParamType::Datetime)
            .property("ids", ParamType::Array(Box::new(ParamType::Integer)))
    }

    #[test]
    fn decodes_declared_primitives() {
        let schema = schema();
        let params = decode_query_params(
            Some("message=hello%20world&count=42&ratio=1.5&flag=true&at=2024-01-01T00%3A00%3A00Z"),
            Some(&schema),
        );
        assert_eq!(params["message"], ParamValue::String("hello world".into()));
        assert_eq!(params["count"], ParamValue::Integer(42));
        assert_eq!(params["ratio"], ParamValue::Float(1.5));
        assert_eq!(params["flag"], ParamValue::Boolean(true));
        assert_eq!(params["at"], ParamValue::String("2024-01-01T00:00:00Z".into()));
    }

    #[test]
    fn absent_params_are_omitted() {
        let schema = schema();
        let params = decode_query_params(Some("count=1"), Some(&schema));
        assert_eq!(params.len(), 1);
        assert!(!params.contains_key("message"));
    }

    #[test]
    fn undeclared_keys_are_ignored() {
        let schema = schema();
        let params = decode_query_params(Some("unknown=1&count=2"), Some(&schema));
        assert_eq!(params.len(), 1);
        assert_eq!(params["count"], ParamValue::Integer(2));
    }

    #[test]
    fn repeated_keys_collect_into_arrays() {
        let schema = schema();
        let params = decode_query_params(Some("ids=1&ids=2&ids=3"), Some(&schema));
        assert_eq!(
            params["ids"],
            ParamValue::Array(vec![
                ParamValue::Integer(1),
                ParamValue::Integer(2),
                ParamValue::Integer(3),
            ])
        );
    }

    #[test]
    fn single_scalar_decodes_as_one_element_array() {
        let schema = schema();
        let params = decode_query_params(Some("ids=7"), Some(&schema));
        assert_eq!(params["ids"], ParamValue::Array(vec![ParamValue::Integer(7)]));
    }

    #[test]
    fn scalar_params_take_the_first_occurrence() {
        let schema = schema();
        let params = decode_query_params(Some("count=1&count=2"), Some(&schema));
        assert_eq!(params["count"], ParamValue::Integer(1));
    }

    #[test]
    fn non_parsing_integers_decode_to_zero() {
        let schema = schema();
        let params = decode_query_params(Some("count=banana"), Some(&schema));
        assert_eq!(params["count"], ParamValue::Integer(0));
    }

    #[test]
    fn booleans_are_strict() {
        let schema = schema();
        for (raw, expected) in [("true", true), ("TRUE", false), ("1", false), ("", false)] {
            let params = decode_query_params(Some(&format!("flag={raw}")), Some(&schema));
            assert_eq!(params["flag"], ParamValue::Boolean(expected), "{raw:?}");
        }
    }

    #[test]
    fn no_schema_means_no_params() {
        assert!(decode_query_params(Some("a=1"), None).is_empty());
        let schema = schema();
        assert!(decode_query_params(None, Some(&schema)).is_empty());
    }

    quickcheck::quickcheck! {
        // encode → decode is the identity for legally-typed params
        fn roundtrips_encoded_params(message: String, count: i64, flag: bool, ids: Vec<i64>) -> bool {
            let schema = schema();
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            serializer.append_pair("message", &message);
            serializer.append_pair("count", &count.to_string());
            serializer.append_pair("flag", if flag { "true" } else { "false" });
            for id in &ids {
                serializer.append_pair("ids", &id.to_string());
            }
            let query = serializer.finish();

            let params = decode_query_params(Some(&query), Some(&schema));
            params["message"] == ParamValue::String(message)
                && params["count"] == ParamValue::Integer(count)
                && params["flag"] == ParamValue::Boolean(flag)
                && match params.get("ids") {
                    None => ids.is_empty(),
                    Some(ParamValue::Array(items)) => {
                        items.iter().map(|v| match v {
                            ParamValue::Integer(i) => *i,
                            _ => i64::MIN,
                        })
                        .eq(ids.iter().copied())
                    }
                    Some(_) => false,
                }
        }
    }
}
