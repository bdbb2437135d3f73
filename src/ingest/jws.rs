// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compact JWS tokens carried by every log frame.
//!
//! Workers sign with HS512 over their session key; hatcheries sign with EdDSA.
//! Log signatures carry no registered claims (`exp`, `aud`...), so validation
//! is reduced to the algorithm and the signature.

use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::IngestError;
use crate::storage::traits::StorageError;

fn token_err(e: JwtError) -> IngestError {
    match e.kind() {
        ErrorKind::InvalidSignature => StorageError::Unauthorized("signature mismatch".into()).into(),
        ErrorKind::InvalidAlgorithm => StorageError::Unauthorized("unexpected token algorithm".into()).into(),
        _ => IngestError::Token(e.to_string()),
    }
}

fn validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation
}

fn verify<T: DeserializeOwned>(token: &str, key: &DecodingKey, alg: Algorithm) -> Result<T, IngestError> {
    jsonwebtoken::decode::<T>(token, key, &validation(alg))
        .map(|data| data.claims)
        .map_err(token_err)
}

/// Read the claims without checking the signature.
///
/// Only used to find out which principal's key to verify with.
pub fn unsafe_parse<T: DeserializeOwned>(token: &str) -> Result<T, IngestError> {
    let mut validation = validation(Algorithm::HS512);
    validation.insecure_disable_signature_validation();
    jsonwebtoken::decode::<T>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| IngestError::Token(e.to_string()))
}

pub fn sign_hs512<T: Serialize>(claims: &T, key: &[u8]) -> Result<String, IngestError> {
    jsonwebtoken::encode(&Header::new(Algorithm::HS512), claims, &EncodingKey::from_secret(key))
        .map_err(|e| IngestError::Token(e.to_string()))
}

pub fn verify_hs512<T: DeserializeOwned>(token: &str, key: &[u8]) -> Result<T, IngestError> {
    verify(token, &DecodingKey::from_secret(key), Algorithm::HS512)
}

pub fn sign_eddsa<T: Serialize>(claims: &T, key: &SigningKey) -> Result<String, IngestError> {
    let der = key.to_pkcs8_der().map_err(|e| IngestError::Token(format!("signing key: {}", e)))?;
    jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), claims, &EncodingKey::from_ed_der(der.as_bytes()))
        .map_err(|e| IngestError::Token(e.to_string()))
}

pub fn verify_eddsa<T: DeserializeOwned>(token: &str, key: &VerifyingKey) -> Result<T, IngestError> {
    // raw 32-byte public key
    verify(token, &DecodingKey::from_ed_der(key.as_bytes()), Algorithm::EdDSA)
}
