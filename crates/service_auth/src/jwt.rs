// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::keypair::{SigningKeypair, VerifyingKey};

/// Default token lifetime.
const DEFAULT_LIFETIME_SECS: u64 = 60;

/// JWT `typ` values that must never be accepted as service tokens.
const REFUSED_TYPES: [&str; 3] = ["at+jwt", "refresh+jwt", "dpop+jwt"];

/// Whether a token is pinned to one lexicon method.
///
/// Unbound is an explicit caller choice, not a default; a token minted
/// without thinking about `lxm` should be bound.
#[derive(Debug, Clone, Copy)]
pub enum LexiconMethod<'a> {
    Bound(&'a str),
    Unbound,
}

pub struct ServiceJwtParams<'a, K: SigningKeypair + ?Sized> {
    pub iss: &'a str,
    pub aud: &'a str,
    /// Seconds since epoch; defaults to 60s from now.
    pub exp: Option<u64>,
    pub lxm: LexiconMethod<'a>,
    pub keypair: &'a K,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceJwtPayload {
    pub iss: String,
    pub aud: String,
    pub exp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lxm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Verification failures; each maps to a distinct wire subcode under the
/// authentication-required error kind.
#[derive(Debug, thiserror::Error)]
pub enum ServiceAuthError {
    #[error("poorly formatted jwt: {0}")]
    BadJwt(&'static str),
    #[error("service tokens must not use the {0:?} typ")]
    BadJwtType(String),
    #[error("jwt expired")]
    JwtExpired,
    #[error("jwt audience does not match service did")]
    BadJwtAudience,
    #[error("{0}")]
    BadJwtLexiconMethod(String),
    #[error("jwt signature does not match jwt issuer")]
    BadJwtSignature,
}

impl ServiceAuthError {
    /// The wire `error` name for this failure.
    pub fn name(&self) -> &'static str {
        match self {
            ServiceAuthError::BadJwt(_) => "BadJwt",
            ServiceAuthError::BadJwtType(_) => "BadJwtType",
            ServiceAuthError::JwtExpired => "JwtExpired",
            ServiceAuthError::BadJwtAudience => "BadJwtAudience",
            ServiceAuthError::BadJwtLexiconMethod(_) => "BadJwtLexiconMethod",
            ServiceAuthError::BadJwtSignature => "BadJwtSignature",
        }
    }
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mint a signed service JWT.
pub fn create_service_jwt<K: SigningKeypair + ?Sized>(params: ServiceJwtParams<'_, K>) -> String {
    let iat = now_seconds();
    let exp = params.exp.unwrap_or(iat + DEFAULT_LIFETIME_SECS);

    let mut jti = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut jti);

    let header = serde_json::json!({ "typ": "JWT", "alg": params.keypair.alg() });
    let payload = ServiceJwtPayload {
        iss: params.iss.to_owned(),
        aud: params.aud.to_owned(),
        exp,
        iat: Some(iat),
        lxm: match params.lxm {
            LexiconMethod::Bound(lxm) => Some(lxm.to_owned()),
            LexiconMethod::Unbound => None,
        },
        jti: Some(hex::encode(jti)),
        nonce: None,
    };

    // serializing maps of strings and integers can't fail
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).unwrap());
    let signing_input = format!("{header}.{payload}");
    let signature = URL_SAFE_NO_PAD.encode(params.keypair.sign(signing_input.as_bytes()));
    format!("{signing_input}.{signature}")
}

/// Verify a service JWT.
///
/// `own_did`, when given, must match the token's `aud`; `lxm`, when given,
/// must match the token's `lxm`. `get_signing_key(iss, force_refresh)`
/// resolves the issuer's current verification key; when a signature fails to
/// verify, the key is re-fetched once with `force_refresh` and verification
/// is retried only if the key actually changed.
pub async fn verify_service_jwt<F, Fut, K>(
    token: &str,
    own_did: Option<&str>,
    lxm: Option<&str>,
    mut get_signing_key: F,
) -> Result<ServiceJwtPayload, ServiceAuthError>
where
    F: FnMut(String, bool) -> Fut,
    Fut: Future<Output = anyhow::Result<K>>,
    K: VerifyingKey,
{
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ServiceAuthError::BadJwt("expected three dot-separated parts"));
    };

    let header = decode_json_segment(header_b64, "header")?;
    if let Some(typ) = header.get("typ").and_then(serde_json::Value::as_str) {
        if REFUSED_TYPES.contains(&typ) {
            return Err(ServiceAuthError::BadJwtType(typ.to_owned()));
        }
    }

    let payload = decode_json_segment(payload_b64, "payload")?;
    let payload = parse_payload(&payload)?;

    if now_seconds() > payload.exp {
        return Err(ServiceAuthError::JwtExpired);
    }

    if let Some(own_did) = own_did {
        if payload.aud != own_did {
            return Err(ServiceAuthError::BadJwtAudience);
        }
    }

    if let Some(expected) = lxm {
        match payload.lxm.as_deref() {
            Some(lxm) if lxm == expected => {}
            Some(lxm) => {
                return Err(ServiceAuthError::BadJwtLexiconMethod(format!(
                    "bad jwt lexicon method (\"lxm\"): {lxm}"
                )))
            }
            None => {
                return Err(ServiceAuthError::BadJwtLexiconMethod(
                    "missing jwt lexicon method (\"lxm\")".to_owned(),
                ))
            }
        }
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| ServiceAuthError::BadJwt("signature is not base64url"))?;
    let signing_input = &token[..header_b64.len() + 1 + payload_b64.len()];

    let key = get_signing_key(payload.iss.clone(), false)
        .await
        .map_err(|_| ServiceAuthError::BadJwtSignature)?;
    if !key.verify(signing_input.as_bytes(), &signature) {
        // The issuer may have rotated keys since we cached theirs; retry
        // once with a forced refresh, but only if the key actually changed.
        let fresh = get_signing_key(payload.iss.clone(), true)
            .await
            .map_err(|_| ServiceAuthError::BadJwtSignature)?;
        if fresh.id() == key.id() || !fresh.verify(signing_input.as_bytes(), &signature) {
            return Err(ServiceAuthError::BadJwtSignature);
        }
    }

    Ok(payload)
}

fn decode_json_segment(
    segment: &str,
    what: &'static str,
) -> Result<serde_json::Value, ServiceAuthError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|_| {
        ServiceAuthError::BadJwt(match what {
            "header" => "header is not base64url",
            _ => "payload is not base64url",
        })
    })?;
    serde_json::from_slice(&bytes).map_err(|_| {
        ServiceAuthError::BadJwt(match what {
            "header" => "header is not a json object",
            _ => "payload is not a json object",
        })
    })
}

fn parse_payload(value: &serde_json::Value) -> Result<ServiceJwtPayload, ServiceAuthError> {
    let obj = value
        .as_object()
        .ok_or(ServiceAuthError::BadJwt("payload is not a json object"))?;

    let require_str = |key: &'static str, err: &'static str| {
        obj.get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .ok_or(ServiceAuthError::BadJwt(err))
    };
    let optional_str = |key: &'static str, err: &'static str| match obj.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ServiceAuthError::BadJwt(err)),
    };

    Ok(ServiceJwtPayload {
        iss: require_str("iss", "missing or invalid \"iss\"")?,
        aud: require_str("aud", "missing or invalid \"aud\"")?,
        exp: obj
            .get("exp")
            .and_then(serde_json::Value::as_u64)
            .ok_or(ServiceAuthError::BadJwt("missing or invalid \"exp\""))?,
        iat: obj.get("iat").and_then(serde_json::Value::as_u64),
        lxm: optional_str("lxm", "invalid \"lxm\"")?,
        jti: optional_str("jti", "invalid \"jti\"")?,
        nonce: optional_str("nonce", "invalid \"nonce\"")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::{Ed25519Keypair, Ed25519PublicKey};

    use futures::executor::block_on;

    fn resolver(
        key: Ed25519PublicKey,
    ) -> impl FnMut(String, bool) -> std::future::Ready<anyhow::Result<Ed25519PublicKey>> {
        move |_iss, _force| std::future::ready(Ok(key.clone()))
    }

    fn mint(keypair: &Ed25519Keypair, lxm: LexiconMethod<'_>, exp: Option<u64>) -> String {
        create_service_jwt(ServiceJwtParams {
            iss: &keypair.did(),
            aud: "did:web:service.example",
            exp,
            lxm,
            keypair,
        })
    }

    #[test]
    fn roundtrip_with_lxm() {
        let keypair = Ed25519Keypair::new_random();
        let token = mint(&keypair, LexiconMethod::Bound("io.example.ping"), None);

        let payload = block_on(verify_service_jwt(
            &token,
            Some("did:web:service.example"),
            Some("io.example.ping"),
            resolver(keypair.public_key()),
        ))
        .unwrap();
        assert_eq!(payload.iss, keypair.did());
        assert_eq!(payload.lxm.as_deref(), Some("io.example.ping"));
        assert_eq!(payload.jti.map(|j| j.len()), Some(32));
    }

    #[test]
    fn roundtrip_unbound() {
        let keypair = Ed25519Keypair::new_random();
        let token = mint(&keypair, LexiconMethod::Unbound, None);
        let payload = block_on(verify_service_jwt(
            &token,
            Some("did:web:service.example"),
            None,
            resolver(keypair.public_key()),
        ))
        .unwrap();
        assert_eq!(payload.lxm, None);
    }

    #[test]
    fn expired_token_rejected() {
        let keypair = Ed25519Keypair::new_random();
        let token = mint(&keypair, LexiconMethod::Unbound, Some(now_seconds() - 1));
        let err = block_on(verify_service_jwt(
            &token,
            None,
            None,
            resolver(keypair.public_key()),
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceAuthError::JwtExpired));
    }

    #[test]
    fn wrong_audience_rejected() {
        let keypair = Ed25519Keypair::new_random();
        let token = mint(&keypair, LexiconMethod::Unbound, None);
        let err = block_on(verify_service_jwt(
            &token,
            Some("did:web:other.example"),
            None,
            resolver(keypair.public_key()),
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceAuthError::BadJwtAudience));
    }

    #[test]
    fn lxm_mismatch_and_missing_are_distinguished() {
        let keypair = Ed25519Keypair::new_random();

        let bound = mint(&keypair, LexiconMethod::Bound("io.example.other"), None);
        let err = block_on(verify_service_jwt(
            &bound,
            None,
            Some("io.example.ping"),
            resolver(keypair.public_key()),
        ))
        .unwrap_err();
        assert_eq!(err.to_string(), "bad jwt lexicon method (\"lxm\"): io.example.other");

        let unbound = mint(&keypair, LexiconMethod::Unbound, None);
        let err = block_on(verify_service_jwt(
            &unbound,
            None,
            Some("io.example.ping"),
            resolver(keypair.public_key()),
        ))
        .unwrap_err();
        assert_eq!(err.to_string(), "missing jwt lexicon method (\"lxm\")");
    }

    #[test]
    fn refused_typ_values() {
        let keypair = Ed25519Keypair::new_random();
        for typ in REFUSED_TYPES {
            let header =
                URL_SAFE_NO_PAD.encode(format!("{{\"typ\":\"{typ}\",\"alg\":\"EdDSA\"}}"));
            let payload = URL_SAFE_NO_PAD.encode(
                serde_json::json!({
                    "iss": "did:example:iss",
                    "aud": "did:example:aud",
                    "exp": now_seconds() + 60,
                })
                .to_string(),
            );
            let signing_input = format!("{header}.{payload}");
            let sig = URL_SAFE_NO_PAD.encode(SigningKeypair::sign(&keypair, signing_input.as_bytes()));
            let token = format!("{signing_input}.{sig}");

            let err = block_on(verify_service_jwt(
                &token,
                None,
                None,
                resolver(keypair.public_key()),
            ))
            .unwrap_err();
            assert!(matches!(err, ServiceAuthError::BadJwtType(_)), "{typ}");
        }
    }

    #[test]
    fn malformed_tokens_are_bad_jwts() {
        let keypair = Ed25519Keypair::new_random();
        for token in ["", "one.two", "a.b.c.d", "!!.??.__"] {
            let err = block_on(verify_service_jwt(
                token,
                None,
                None,
                resolver(keypair.public_key()),
            ))
            .unwrap_err();
            assert!(matches!(err, ServiceAuthError::BadJwt(_)), "{token:?}");
        }
    }

    #[test]
    fn tampered_signature_rejected() {
        let keypair = Ed25519Keypair::new_random();
        let token = mint(&keypair, LexiconMethod::Unbound, None);
        let mut tampered = token[..token.len() - 4].to_owned();
        tampered.push_str("AAAA");
        let err = block_on(verify_service_jwt(
            &tampered,
            None,
            None,
            resolver(keypair.public_key()),
        ))
        .unwrap_err();
        assert!(matches!(err, ServiceAuthError::BadJwtSignature));
    }

    #[test]
    fn key_rotation_retry_succeeds_when_key_changed() {
        let old = Ed25519Keypair::new_random();
        let new = Ed25519Keypair::new_random();
        let token = mint(&new, LexiconMethod::Unbound, None);

        // first fetch returns the stale key; forced refresh returns the
        // rotated one
        let old_pub = old.public_key();
        let new_pub = new.public_key();
        let payload = block_on(verify_service_jwt(&token, None, None, move |_iss, force| {
            let key = if force { new_pub.clone() } else { old_pub.clone() };
            std::future::ready(Ok(key))
        }))
        .unwrap();
        assert_eq!(payload.iss, new.did());
    }

    #[test]
    fn key_rotation_retry_skipped_when_key_unchanged() {
        let stale = Ed25519Keypair::new_random();
        let signer = Ed25519Keypair::new_random();
        let token = mint(&signer, LexiconMethod::Unbound, None);

        let mut fetches = 0;
        let stale_pub = stale.public_key();
        let result = block_on(verify_service_jwt(&token, None, None, |_iss, _force| {
            fetches += 1;
            std::future::ready(Ok(stale_pub.clone()))
        }));
        assert!(matches!(result, Err(ServiceAuthError::BadJwtSignature)));
        assert_eq!(fetches, 2);
    }
}
