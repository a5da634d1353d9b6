//! Token issuance
//!
//! Tokens are EdDSA-signed JWTs whose header names the signing key:
//! `{"alg":"EdDSA","kid":"<key id>"}`. The claims carry issuer, subject,
//! audiences, issue and expiry times plus the custom claim set.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, Header};
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::keys::SigningKeyManager;
use crate::types::{ClaimSet, Claims};

/// Builds and signs claims with the active key
#[derive(Clone)]
pub struct TokenIssuer {
    keys: Arc<SigningKeyManager>,
    issuer: String,
    validity: Duration,
}

impl TokenIssuer {
    pub fn new(keys: Arc<SigningKeyManager>, config: &JwtConfig) -> AuthResult<Self> {
        let validity = Duration::from_std(config.validity)
            .map_err(|e| AuthError::Internal(format!("Invalid token validity: {}", e)))?;
        Ok(Self {
            keys,
            issuer: config.issuer.clone(),
            validity,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn keys(&self) -> &Arc<SigningKeyManager> {
        &self.keys
    }

    /// Sign a token for `subject`, valid from `issued_at` for the configured window
    pub fn issue(
        &self,
        subject: &str,
        custom: ClaimSet,
        audiences: Vec<String>,
        issued_at: DateTime<Utc>,
    ) -> AuthResult<String> {
        // One snapshot: key id and private key always belong together
        let key = self.keys.active()?;
        let expires_at = issued_at
            .checked_add_signed(self.validity)
            .ok_or_else(|| AuthError::Internal("Token expiry out of range".to_string()))?;

        let claims = Claims {
            kid: key.id(),
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            aud: audiences,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            user_id: custom.user_id,
            groups: custom.groups,
            extra: custom.extra,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.typ = None;
        header.kid = Some(key.id().to_string());

        let token = encode(&header, &claims, key.encoding_key()).map_err(|e| {
            error!(kid = key.id(), error = %e, "Token signing failed");
            AuthError::SigningFailure(e.to_string())
        })?;
        debug!(kid = key.id(), "Token issued");
        Ok(token)
    }
}
