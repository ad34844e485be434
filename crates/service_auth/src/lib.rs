// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Short-lived service-to-service bearer tokens
//!
//! Tokens are standard JWS compact form (`header.payload.signature`, all
//! base64url without padding) carrying issuer, audience, expiry, and an
//! optional lexicon-method binding (`lxm`) that pins a token to one XRPC
//! method. Verification resolves the issuer's signing key through a caller
//! supplied resolver and retries once on key rotation.

mod jwt;
mod keypair;

pub use jwt::{
    create_service_jwt, verify_service_jwt, LexiconMethod, ServiceAuthError, ServiceJwtParams,
    ServiceJwtPayload,
};
pub use keypair::{Ed25519Keypair, Ed25519PublicKey, SigningKeypair, VerifyingKey};
