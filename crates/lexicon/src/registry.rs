// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The immutable NSID → method registry

use std::collections::HashMap;

use nsid::{Nsid, NsidError};

use crate::data::DataValue;
use crate::schema::{self, ObjectSchema, Params, ParamsSchema, ValidationError};

/// Declared input or output body of a method.
#[derive(Debug, Clone)]
pub struct BodySchema {
    /// Declared MIME type, e.g. `application/json`, `text/plain`, `*/*`.
    pub encoding: String,
    /// Present only for JSON bodies that carry a schema.
    pub schema: Option<ObjectSchema>,
}

impl BodySchema {
    pub fn json(schema: ObjectSchema) -> Self {
        Self {
            encoding: "application/json".to_owned(),
            schema: Some(schema),
        }
    }

    pub fn encoding(encoding: &str) -> Self {
        Self {
            encoding: encoding.to_owned(),
            schema: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryDef {
    pub parameters: Option<ParamsSchema>,
    pub output: Option<BodySchema>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcedureDef {
    pub parameters: Option<ParamsSchema>,
    pub input: Option<BodySchema>,
    pub output: Option<BodySchema>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionDef {
    pub parameters: Option<ParamsSchema>,
    /// Schema of message bodies; `None` leaves messages unvalidated (e.g. a
    /// union the external validator would handle).
    pub message: Option<ObjectSchema>,
    pub errors: Vec<String>,
}

/// One method definition, discriminated by kind.
#[derive(Debug, Clone)]
pub enum MethodDef {
    Query(QueryDef),
    Procedure(ProcedureDef),
    Subscription(SubscriptionDef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Query,
    Procedure,
    Subscription,
}

impl MethodDef {
    pub fn kind(&self) -> MethodKind {
        match self {
            MethodDef::Query(_) => MethodKind::Query,
            MethodDef::Procedure(_) => MethodKind::Procedure,
            MethodDef::Subscription(_) => MethodKind::Subscription,
        }
    }

    pub fn parameters(&self) -> Option<&ParamsSchema> {
        match self {
            MethodDef::Query(def) => def.parameters.as_ref(),
            MethodDef::Procedure(def) => def.parameters.as_ref(),
            MethodDef::Subscription(def) => def.parameters.as_ref(),
        }
    }

    pub fn input(&self) -> Option<&BodySchema> {
        match self {
            MethodDef::Procedure(def) => def.input.as_ref(),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&BodySchema> {
        match self {
            MethodDef::Query(def) => def.output.as_ref(),
            MethodDef::Procedure(def) => def.output.as_ref(),
            MethodDef::Subscription(_) => None,
        }
    }
}

/// All method definitions known to a server.
///
/// Built once before the server starts and never mutated afterwards, so it
/// can be shared across connections without locking.
#[derive(Debug, Default)]
pub struct Lexicons {
    methods: HashMap<String, MethodDef>,
}

impl Lexicons {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method definition under a validated NSID.
    pub fn add(&mut self, nsid: &str, def: MethodDef) -> Result<(), NsidError> {
        let nsid: Nsid = nsid.parse()?;
        self.methods.insert(nsid.as_str().to_owned(), def);
        Ok(())
    }

    pub fn get(&self, nsid: &str) -> Option<&MethodDef> {
        self.methods.get(nsid)
    }

    /// Validate decoded query parameters against the method's schema.
    pub fn assert_valid_xrpc_params(
        &self,
        nsid: &str,
        params: &Params,
    ) -> Result<(), ValidationError> {
        match self.get(nsid).and_then(MethodDef::parameters) {
            Some(schema) => schema::validate_params(schema, params),
            None => Ok(()),
        }
    }

    /// Validate a decoded request body against the method's input schema.
    pub fn assert_valid_xrpc_input(
        &self,
        nsid: &str,
        input: &DataValue,
    ) -> Result<(), ValidationError> {
        match self.get(nsid).and_then(MethodDef::input) {
            Some(BodySchema {
                schema: Some(schema),
                ..
            }) => schema::validate_object("Input", schema, input),
            _ => Ok(()),
        }
    }

    /// Validate a success response body against the method's output schema.
    pub fn assert_valid_xrpc_output(
        &self,
        nsid: &str,
        output: &DataValue,
    ) -> Result<(), ValidationError> {
        match self.get(nsid).and_then(MethodDef::output) {
            Some(BodySchema {
                schema: Some(schema),
                ..
            }) => schema::validate_object("Output", schema, output),
            _ => Ok(()),
        }
    }

    /// Validate one subscription message body, when a message schema is
    /// declared.
    pub fn assert_valid_xrpc_message(
        &self,
        nsid: &str,
        message: &DataValue,
    ) -> Result<(), ValidationError> {
        match self.get(nsid) {
            Some(MethodDef::Subscription(SubscriptionDef {
                message: Some(schema),
                ..
            })) => schema::validate_object("Message", schema, message),
            _ => Ok(()),
        }
    }
}
