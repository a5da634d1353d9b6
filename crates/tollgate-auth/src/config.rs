//! Authentication configuration
//!
//! Settings for token issuance, password hashing, user bootstrap, token
//! verification and the consumer-side middleware. Durations use humantime
//! notation (`24h`, `500ms`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main authentication configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Token issuance configuration
    pub jwt: JwtConfig,
    /// Password hashing configuration
    pub password: PasswordConfig,
    /// Users created or updated at startup
    pub bootstrap: Vec<BootstrapUser>,
}

/// Token issuance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Token issuer claim
    pub issuer: String,
    /// Lifetime of every issued token
    #[serde(with = "humantime_serde")]
    pub validity: Duration,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            issuer: "localhost".to_string(),
            validity: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }
}

/// Password hashing configuration (Argon2id)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordConfig {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost (iterations)
    pub time_cost: u32,
    /// Parallelism factor
    pub parallelism: u32,
    /// Output hash length in bytes
    pub hash_length: u32,
    /// Salt length in bytes
    pub salt_length: usize,
    /// Time that must remain on a call before a hash is computed
    #[serde(with = "humantime_serde")]
    pub hash_budget: Duration,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 64 * 1024, // 64 MiB
            time_cost: 1,
            parallelism: 2,
            hash_length: 32,
            salt_length: 8,
            hash_budget: Duration::from_secs(1),
        }
    }
}

/// A user ensured to exist at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapUser {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub audiences: Vec<String>,
}

impl AuthConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Token validation
        if self.jwt.issuer.is_empty() {
            errors.push("JWT issuer must be set".to_string());
        }
        if self.jwt.validity.is_zero() {
            errors.push("JWT validity must be positive".to_string());
        }
        let expiry_fits = chrono::Duration::from_std(self.jwt.validity)
            .ok()
            .and_then(|validity| chrono::Utc::now().checked_add_signed(validity))
            .is_some();
        if !expiry_fits {
            errors.push("JWT validity is too large".to_string());
        }

        // Password validation
        if self.password.salt_length < 8 {
            errors.push("Salt length should be at least 8 bytes".to_string());
        }
        if self.password.hash_length < 16 {
            errors.push("Hash length should be at least 16 bytes".to_string());
        }
        if self.password.time_cost < 1 {
            errors.push("Argon2 time cost must be at least 1".to_string());
        }
        if self.password.parallelism < 1 {
            errors.push("Argon2 parallelism must be at least 1".to_string());
        }
        if self.password.memory_cost < 8 * self.password.parallelism {
            errors.push("Argon2 memory cost must be at least 8 KiB per lane".to_string());
        }

        for user in &self.bootstrap {
            if user.email.is_empty() {
                errors.push("Bootstrap user without email".to_string());
            }
            if user.password.is_empty() {
                errors.push(format!("Bootstrap user {} has an empty password", user.email));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// When non-empty, tokens must carry at least one of these audiences
    pub audiences: Vec<String>,
}

/// Consumer-side middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// When non-empty, tokens must name at least one of these groups
    pub groups: Vec<String>,
    /// Where unauthenticated requests are sent
    pub login_url: String,
    /// Query key carrying the return address on the login redirect
    pub redirect_key: String,
    /// Scheme and authority prefixed to the return address
    pub server_address: String,
    /// Tokens expiring sooner than this are refreshed
    #[serde(with = "humantime_serde")]
    pub refresh_within: Duration,
    /// Name of the query parameter and cookie holding the token
    pub token_name: String,
    /// Deadline for remote calls made while guarding one request
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            login_url: "/login".to_string(),
            redirect_key: "redirect".to_string(),
            server_address: String::new(),
            refresh_within: Duration::from_secs(12 * 60 * 60), // 12 hours
            token_name: "jwt".to_string(),
            call_timeout: Duration::from_secs(5),
        }
    }
}
