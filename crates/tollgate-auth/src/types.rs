//! Core authentication types
//!
//! Token claims and the request/response messages of the authenticator RPC
//! surface.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

// =============================================================================
// Token Claims
// =============================================================================

/// Signed payload of a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Id of the signing key, taken from the token header
    #[serde(skip)]
    pub kid: i32,
    /// Issuer
    pub iss: String,
    /// Subject (user email or name, `public:<uuid>` for anonymous tokens)
    pub sub: String,
    /// Audiences the token is valid for
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "one_or_many"
    )]
    pub aud: Vec<String>,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiration time (unix seconds)
    pub exp: i64,
    /// Database id of the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i32>,
    /// Names of the user's groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// Any further custom claims
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Expired iff `now` has reached the expiry time.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    pub fn groups(&self) -> &[String] {
        self.groups.as_deref().unwrap_or_default()
    }

    pub fn has_audience(&self, audience: &str) -> bool {
        self.aud.iter().any(|a| a == audience)
    }

    /// Whether the claims name at least one of `required`
    pub fn is_member_of_any(&self, required: &[String]) -> bool {
        self.groups().iter().any(|g| required.contains(g))
    }
}

/// Custom claims attached at issuance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimSet {
    pub user_id: Option<i32>,
    pub groups: Option<Vec<String>>,
    pub extra: Map<String, Value>,
}

impl ClaimSet {
    /// Claims of an authenticated user
    pub fn for_user(user_id: i32, groups: Vec<String>) -> Self {
        Self {
            user_id: Some(user_id),
            groups: Some(groups),
            extra: Map::new(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(aud)) => vec![aud],
        Some(OneOrMany::Many(aud)) => aud,
        None => Vec::new(),
    })
}

// =============================================================================
// RPC Messages
// =============================================================================

/// Exactly one way of naming a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserIdentifier {
    Email(String),
    Name(String),
}

impl UserIdentifier {
    pub fn value(&self) -> &str {
        match self {
            Self::Email(v) | Self::Name(v) => v,
        }
    }
}

/// Exactly one proof that the caller may change a password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordCredential {
    OldPassword(String),
    ResetToken(String),
}

/// Where a token is delivered, e.g. in a verification mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackUrl {
    pub base_url: String,
    #[serde(default = "default_token_key")]
    pub token_key: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

fn default_token_key() -> String {
    "token".to_string()
}

impl CallbackUrl {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token_key: default_token_key(),
            params: BTreeMap::new(),
        }
    }

    /// `base_url?<query>` where the query holds the token under `token_key`
    /// plus `params`, sorted by key and url-encoded. A param named like the
    /// token key replaces the token.
    pub fn render(&self, token: &str) -> String {
        let token_key = if self.token_key.is_empty() {
            "token"
        } else {
            self.token_key.as_str()
        };
        let mut values: BTreeMap<&str, &str> = BTreeMap::new();
        values.insert(token_key, token);
        for (key, value) in &self.params {
            values.insert(key, value);
        }

        let query = values
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.base_url, separator, query)
    }
}

/// RegisterPwUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationData {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub url: Option<CallbackUrl>,
}

/// AuthenticatePwUser request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPassword {
    pub user: UserIdentifier,
    pub password: String,
}

/// ChangeUserPw request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUserPassword {
    /// Required with an old password, optional with a reset token
    #[serde(default)]
    pub user: Option<UserIdentifier>,
    pub credential: PasswordCredential,
    pub new_password: String,
}

/// CheckUserExists request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
}

/// CheckUserExists reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exists {
    pub email: bool,
    pub name: bool,
}

/// A signed token, in requests and replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub jwt: String,
}

/// PublicUserToken request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicUser {
    #[serde(default)]
    pub uuid: String,
}

/// GetPubKey request
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyId {
    #[serde(default)]
    pub kid: i32,
}

/// GetPubKey reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    #[serde(with = "base64_bytes")]
    pub key: Vec<u8>,
}

/// ChangeUserPw and ResetUserPw reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Success {
    pub success: bool,
}

/// ResetUserPw request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEmail {
    pub email: String,
    #[serde(default)]
    pub url: Option<CallbackUrl>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
