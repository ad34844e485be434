// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! XRPC method definitions and schema validation
//!
//! This crate holds the data model the dispatch engine is driven by: the
//! immutable NSID → method registry, typed query parameters, and the
//! IPLD-aware data value with its `$link`/`$bytes` JSON projection.
//!
//! The registry exposes the three validation entry points the engine calls
//! (`assert_valid_xrpc_params`, `assert_valid_xrpc_input`,
//! `assert_valid_xrpc_output`). Schemas are registered programmatically;
//! parsing lexicon JSON documents is outside this crate.

pub mod data;
pub mod registry;
pub mod schema;

pub use data::{CidLink, DataValue};
pub use registry::{BodySchema, Lexicons, MethodDef, MethodKind, ProcedureDef, QueryDef, SubscriptionDef};
pub use schema::{ObjectSchema, ParamType, ParamValue, Params, ParamsSchema, PropType, ValidationError};
