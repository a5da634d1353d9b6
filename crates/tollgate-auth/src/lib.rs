//! Tollgate Authentication Layer
//!
//! Network identity provider for a fleet of services:
//!
//! - **Password Users**: Registration, login, password change and reset
//! - **Signed Tokens**: EdDSA (Ed25519) JWTs carrying groups and audiences
//! - **Key Rotation**: Fresh signing keys with their public halves persisted
//! - **Verification**: Key cache plus token guard middleware for consumers
//! - **Password Security**: Argon2id hashing with per-user salts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Identity Provider                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  POST /authenticator.v1/<Method> → rpc::router               │
//! │                              │                               │
//! │                              ▼                               │
//! │                         AuthService                          │
//! │              ┌───────────────┼───────────────┐               │
//! │              ▼               ▼               ▼               │
//! │     RequestTransaction  CredentialStore  TokenIssuer         │
//! │              │                               │               │
//! │              ▼                               ▼               │
//! │          MultiDb  ◄──── public keys ── SigningKeyManager     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Consuming Service                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request → AuthLayer → Handler(VerifiedClaims)               │
//! │               │                                              │
//! │               ▼                                              │
//! │        TokenVerifier → KeyCache → HttpAuthenticator          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod jwt;
pub mod keys;
pub mod middleware;
pub mod notify;
pub mod password;
pub mod rpc;
pub mod service;
pub mod transaction;
pub mod types;
pub mod verify;

pub use config::{AuthConfig, JwtConfig, MiddlewareConfig, PasswordConfig, VerifierConfig};
pub use context::CallContext;
pub use error::{AuthError, AuthResult, ErrorResponse, RpcCode};
pub use jwt::TokenIssuer;
pub use keys::SigningKeyManager;
pub use middleware::{AuthLayer, AuthMiddleware, VerifiedClaims};
pub use notify::{LogNotifier, NotificationKind, Notifier};
pub use password::{Argon2Kdf, CredentialStore, Kdf};
pub use rpc::{router, Authenticator, HttpAuthenticator};
pub use service::AuthService;
pub use transaction::RequestTransaction;
pub use types::*;
pub use verify::{KeyCache, KeyResolver, TokenVerifier};
