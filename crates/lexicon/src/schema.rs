// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parameter and body schemas, and the validation they drive

use std::collections::HashMap;

use crate::data::DataValue;

/// A decoded query parameter value.
///
/// Datetimes travel as strings; arrays hold primitives of one declared item
/// type.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Array(Vec<ParamValue>),
}

/// Decoded query parameters, keyed by declared name.
///
/// Absent optional parameters are omitted entirely, never stored as null.
pub type Params = HashMap<String, ParamValue>;

/// Declared type of one query parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Array(Box<ParamType>),
}

impl ParamType {
    fn describe(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::Boolean => "boolean",
            ParamType::Datetime => "datetime",
            ParamType::Array(_) => "array",
        }
    }

    fn matches(&self, value: &ParamValue) -> bool {
        match (self, value) {
            (ParamType::String | ParamType::Datetime, ParamValue::String(_)) => true,
            (ParamType::Integer, ParamValue::Integer(_)) => true,
            (ParamType::Float, ParamValue::Float(_) | ParamValue::Integer(_)) => true,
            (ParamType::Boolean, ParamValue::Boolean(_)) => true,
            (ParamType::Array(item), ParamValue::Array(items)) => {
                items.iter().all(|v| item.matches(v))
            }
            _ => false,
        }
    }
}

/// Schema for a method's query parameters.
#[derive(Debug, Clone, Default)]
pub struct ParamsSchema {
    pub required: Vec<String>,
    pub properties: HashMap<String, ParamType>,
}

impl ParamsSchema {
    pub fn property(mut self, name: &str, ty: ParamType) -> Self {
        self.properties.insert(name.to_owned(), ty);
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_owned());
        self
    }
}

/// Shallow declared type of one body property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropType {
    String,
    Integer,
    Float,
    Boolean,
    Bytes,
    CidLink,
    Array,
    Object,
    /// Accept anything; deep validation belongs to a full lexicon validator.
    Unknown,
}

impl PropType {
    fn describe(&self) -> &'static str {
        match self {
            PropType::String => "string",
            PropType::Integer => "integer",
            PropType::Float => "float",
            PropType::Boolean => "boolean",
            PropType::Bytes => "bytes",
            PropType::CidLink => "cid-link",
            PropType::Array => "array",
            PropType::Object => "object",
            PropType::Unknown => "unknown",
        }
    }

    fn matches(&self, value: &DataValue) -> bool {
        match (self, value) {
            (PropType::Unknown, _) => true,
            (PropType::String, DataValue::String(_)) => true,
            (PropType::Integer, DataValue::Integer(_)) => true,
            (PropType::Float, DataValue::Float(_) | DataValue::Integer(_)) => true,
            (PropType::Boolean, DataValue::Bool(_)) => true,
            (PropType::Bytes, DataValue::Bytes(_)) => true,
            (PropType::CidLink, DataValue::CidLink(_)) => true,
            (PropType::Array, DataValue::Array(_)) => true,
            (PropType::Object, DataValue::Object(_)) => true,
            _ => false,
        }
    }
}

/// Schema for a JSON body or subscription message.
#[derive(Debug, Clone, Default)]
pub struct ObjectSchema {
    pub required: Vec<String>,
    pub properties: HashMap<String, PropType>,
}

impl ObjectSchema {
    pub fn property(mut self, name: &str, ty: PropType) -> Self {
        self.properties.insert(name.to_owned(), ty);
        self
    }

    pub fn require(mut self, name: &str) -> Self {
        self.required.push(name.to_owned());
        self
    }
}

/// A schema violation, worded for the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{subject} must have the property {property:?}")]
    MissingProperty {
        subject: &'static str,
        property: String,
    },
    #[error("{subject} property {property:?} must be a {expected}")]
    WrongType {
        subject: &'static str,
        property: String,
        expected: &'static str,
    },
    #[error("{subject} must be an object")]
    NotAnObject { subject: &'static str },
}

pub(crate) fn validate_params(
    schema: &ParamsSchema,
    params: &Params,
) -> Result<(), ValidationError> {
    let subject = "Params";
    for name in &schema.required {
        if !params.contains_key(name) {
            return Err(ValidationError::MissingProperty {
                subject,
                property: name.clone(),
            });
        }
    }
    for (name, value) in params {
        if let Some(ty) = schema.properties.get(name) {
            if !ty.matches(value) {
                return Err(ValidationError::WrongType {
                    subject,
                    property: name.clone(),
                    expected: ty.describe(),
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn validate_object(
    subject: &'static str,
    schema: &ObjectSchema,
    value: &DataValue,
) -> Result<(), ValidationError> {
    let Some(map) = value.as_object() else {
        return Err(ValidationError::NotAnObject { subject });
    };
    for name in &schema.required {
        if !map.contains_key(name) {
            return Err(ValidationError::MissingProperty {
                subject,
                property: name.clone(),
            });
        }
    }
    for (name, value) in map {
        if let Some(ty) = schema.properties.get(name) {
            if !ty.matches(value) {
                return Err(ValidationError::WrongType {
                    subject,
                    property: name.clone(),
                    expected: ty.describe(),
                });
            }
        }
    }
    Ok(())
}
