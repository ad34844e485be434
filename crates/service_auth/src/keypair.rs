// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Signing abstractions for service JWTs
//!
//! Tokens are signed by whatever scheme the deployment uses; the JWT layer
//! only needs an `alg` identifier, signing, and a way to tell two resolved
//! verification keys apart (for the rotation retry). An ed25519
//! implementation is provided.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use rand::rngs::OsRng;

/// A keypair that can mint service JWTs.
pub trait SigningKeypair: Send + Sync {
    /// JWS `alg` header value, e.g. `"EdDSA"`.
    fn alg(&self) -> &'static str;

    /// The DID this key authenticates as; what verifiers resolve via the
    /// issuer.
    fn did(&self) -> String;

    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// A resolved verification key.
pub trait VerifyingKey: Send + Sync {
    /// Stable identifier, used to detect whether a forced re-fetch actually
    /// rotated the key.
    fn id(&self) -> String;

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool;
}

/// An ed25519 service keypair.
#[derive(Clone)]
pub struct Ed25519Keypair(SigningKey);

impl Ed25519Keypair {
    pub fn new_random() -> Self {
        let mut rng = OsRng;
        Self(SigningKey::generate(&mut rng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey(self.0.verifying_key())
    }
}

impl SigningKeypair for Ed25519Keypair {
    fn alg(&self) -> &'static str {
        "EdDSA"
    }

    fn did(&self) -> String {
        self.public_key().id()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.0.sign(message).to_bytes().to_vec()
    }
}

/// The verification half of [`Ed25519Keypair`].
#[derive(Clone)]
pub struct Ed25519PublicKey(ed25519_dalek::VerifyingKey);

impl VerifyingKey for Ed25519PublicKey {
    fn id(&self) -> String {
        // multibase base64url ("u" prefix) over the raw public key bytes
        format!("did:key:u{}", URL_SAFE_NO_PAD.encode(self.0.to_bytes()))
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.0.verify(message, &signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Ed25519Keypair::new_random();
        let sig = keypair.sign(b"some message");
        assert!(keypair.public_key().verify(b"some message", &sig));
        assert!(!keypair.public_key().verify(b"other message", &sig));
        assert!(!keypair.public_key().verify(b"some message", b"junk"));
    }

    #[test]
    fn did_matches_key_id() {
        let keypair = Ed25519Keypair::new_random();
        assert_eq!(keypair.did(), keypair.public_key().id());
        assert!(keypair.did().starts_with("did:key:u"));
    }
}
