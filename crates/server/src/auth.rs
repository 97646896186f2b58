use anyhow::{anyhow, Context, Result};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use crewline_crypto::{
    generate_signing_key, sign_message, verify_signature, verifying_key_from, Signature,
    SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AuthConfig;

pub const DEFAULT_TOKEN_TTL_HOURS: i64 = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential presented")]
    MissingToken,
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature is invalid")]
    BadSignature,
    #[error("credential is expired")]
    Expired,
}

/// The verified caller of a websocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub role: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    user_id: Uuid,
    tenant_id: Uuid,
    role: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Signs access tokens. In production the platform's auth service holds the
/// same key and mints tokens; the gateway keeps a signer so the
/// `issue-token` CLI command and the test harness can produce credentials.
#[derive(Clone)]
pub struct AccessTokenSigner {
    signing_key: SigningKey,
}

impl AccessTokenSigner {
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        match config.signing_key.as_deref() {
            Some(raw) => {
                let decoded = URL_SAFE_NO_PAD
                    .decode(raw.trim())
                    .with_context(|| "failed to decode auth signing key from base64 (URL-safe)")?;
                let bytes: [u8; 32] = decoded
                    .try_into()
                    .map_err(|_| anyhow!("auth signing key must be 32 bytes"))?;
                Ok(Self {
                    signing_key: SigningKey::from_bytes(&bytes),
                })
            }
            None => Ok(Self {
                signing_key: generate_signing_key(),
            }),
        }
    }

    pub fn verifying_key_base64(&self) -> String {
        let verifying = verifying_key_from(&self.signing_key);
        URL_SAFE_NO_PAD.encode(verifying.as_bytes())
    }

    pub fn verifier(&self) -> AccessTokenVerifier {
        AccessTokenVerifier {
            verifying_key: verifying_key_from(&self.signing_key),
        }
    }

    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<String> {
        let issued_at = Utc::now();
        let claims = AccessClaims {
            user_id: identity.user_id,
            tenant_id: identity.tenant_id,
            role: identity.role.clone(),
            issued_at,
            expires_at: issued_at + ttl,
        };
        let payload = serde_json::to_vec(&claims)?;
        let signature = sign_message(&self.signing_key, &payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }
}

/// Validates the bearer credential presented at connection time and derives
/// the caller's identity.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    verifying_key: VerifyingKey,
}

impl AccessTokenVerifier {
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        let signature_array: [u8; 64] = signature_bytes
            .try_into()
            .map_err(|_| AuthError::Malformed)?;
        let signature = Signature::from_bytes(&signature_array);

        verify_signature(&self.verifying_key, &payload, &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: AccessClaims =
            serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(AuthError::Expired);
        }

        Ok(Identity {
            user_id: claims.user_id,
            tenant_id: claims.tenant_id,
            role: claims.role,
        })
    }
}

/// Pull the bearer credential from the upgrade request: the `token` query
/// parameter wins, falling back to an `Authorization: Bearer` header.
pub fn bearer_token<'a>(query_token: Option<&'a str>, headers: &'a HeaderMap) -> Option<&'a str> {
    if let Some(token) = query_token.map(str::trim).filter(|token| !token.is_empty()) {
        return Some(token);
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
