//! Token verification
//!
//! ```text
//! token → parse_header (kid, alg)
//!       → KeyResolver::resolve(kid)   local cache, or remote GetPubKey on miss
//!       → EdDSA signature check
//!       → expiry check against `now`
//!       → audience check (when configured)
//! ```
//!
//! Each step has its own error so callers can tell a malformed token from an
//! unreachable key authority from a token the authority rejects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::VerifierConfig;
use crate::context::CallContext;
use crate::error::{AuthError, AuthResult, RpcCode};
use crate::rpc::Authenticator;
use crate::types::{Claims, KeyId};

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Decode the unsigned header and return its key id.
pub fn parse_header(token: &str) -> AuthResult<i32> {
    let mut segments = token.split('.');
    let header = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(header), Some(_), Some(_), None) => header,
        _ => return Err(AuthError::HeaderMalformed("expected three segments".to_string())),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| AuthError::HeaderMalformed(e.to_string()))?;
    let raw: RawHeader =
        serde_json::from_slice(&bytes).map_err(|e| AuthError::HeaderMalformed(e.to_string()))?;

    if raw.alg != "EdDSA" {
        return Err(AuthError::UnsupportedAlgorithm(raw.alg));
    }

    match raw.kid.as_deref().map(str::parse::<i32>) {
        Some(Ok(kid)) if kid > 0 => Ok(kid),
        _ => Err(AuthError::HeaderMalformed("invalid key id".to_string())),
    }
}

/// Check signature, expiry and audience of `token` under a resolved public key.
pub fn verify_with_key(
    token: &str,
    kid: i32,
    public_key: &[u8],
    now: DateTime<Utc>,
    audiences: &[String],
) -> AuthResult<Claims> {
    let decoding_key = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(public_key))
        .map_err(|_| AuthError::SignatureInvalid)?;

    // Expiry and audience are checked below, against the caller's clock and settings
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.set_required_spec_claims::<&str>(&[]);

    let mut claims = decode::<Claims>(token, &decoding_key, &validation)
        .map_err(map_jwt_error)?
        .claims;
    claims.kid = kid;

    if claims.is_expired_at(now) {
        return Err(AuthError::TokenExpired);
    }
    if !audiences.is_empty() && !audiences.iter().any(|aud| claims.has_audience(aud)) {
        return Err(AuthError::InvalidAudience);
    }
    Ok(claims)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidEcdsaKey
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::Crypto(_) => AuthError::SignatureInvalid,
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            AuthError::UnsupportedAlgorithm(err.to_string())
        }
        _ => AuthError::ClaimsMalformed(err.to_string()),
    }
}

/// Maps a key id to the public key that verifies its tokens.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve(&self, ctx: &CallContext, kid: i32) -> AuthResult<Vec<u8>>;
}

/// Lazily filled kid → public key map in front of a remote key authority.
///
/// Entries are never evicted or replaced: rotation creates new ids and never
/// rebinds an existing one.
pub struct KeyCache {
    client: Arc<dyn Authenticator>,
    keys: RwLock<HashMap<i32, Vec<u8>>>,
}

impl KeyCache {
    pub fn new(client: Arc<dyn Authenticator>) -> Self {
        Self {
            client,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

#[async_trait]
impl KeyResolver for KeyCache {
    async fn resolve(&self, ctx: &CallContext, kid: i32) -> AuthResult<Vec<u8>> {
        let cached = self.keys.read().get(&kid).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }

        let fetched = match ctx.run(self.client.get_pub_key(ctx, KeyId { kid })).await {
            Ok(Ok(reply)) if reply.key.is_empty() => Err(AuthError::KeyNotFound),
            Ok(Ok(reply)) => Ok(reply.key),
            Ok(Err(e)) if e.rpc_code() == RpcCode::NotFound => Err(AuthError::KeyNotFound),
            Ok(Err(e)) | Err(e) => Err(AuthError::CommunicationFailure(e.to_string())),
        };
        let key = fetched.map_err(|e| {
            warn!(kid, error = %e, "Public key lookup failed");
            e
        })?;

        debug!(kid, "Public key cached");
        Ok(self.keys.write().entry(kid).or_insert(key).clone())
    }
}

/// Verifies tokens against keys from a [`KeyResolver`].
#[derive(Clone)]
pub struct TokenVerifier {
    resolver: Arc<dyn KeyResolver>,
    audiences: Vec<String>,
}

impl TokenVerifier {
    pub fn new(resolver: Arc<dyn KeyResolver>, config: &VerifierConfig) -> Self {
        Self {
            resolver,
            audiences: config.audiences.clone(),
        }
    }

    /// Verify `token` at time `now`. Failures are final; nothing is retried.
    pub async fn verify(
        &self,
        ctx: &CallContext,
        token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Claims> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let kid = parse_header(token)?;
        let public_key = self.resolver.resolve(ctx, kid).await?;
        verify_with_key(token, kid, &public_key, now, &self.audiences)
    }
}
