//! Authentication error types
//!
//! One typed enumeration covers credential checks, token verification,
//! time budgets and infrastructure failures. Mapping to outward codes is an
//! exhaustive `match`, so adding a variant forces a decision on how it is
//! reported. Errors are designed to be:
//! - Informative for logging/debugging
//! - Safe for external exposure (no query text, no hint which credential check failed)
//! - Convertible to RPC codes and HTTP status codes

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tollgate_db::DbError;

/// Result type alias for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Outward status codes of the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    AlreadyExists,
    Aborted,
    DeadlineExceeded,
    Cancelled,
    Unavailable,
    Unimplemented,
    Internal,
}

impl RpcCode {
    /// HTTP status used when the code travels over the HTTP transport
    pub fn status_code(self) -> u16 {
        match self {
            Self::InvalidArgument => 400,
            Self::Unauthenticated => 401,
            Self::PermissionDenied => 403,
            Self::NotFound => 404,
            Self::AlreadyExists | Self::Aborted => 409,
            Self::Cancelled => 499,
            Self::Internal => 500,
            Self::Unimplemented => 501,
            Self::Unavailable => 503,
            Self::DeadlineExceeded => 504,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::Aborted => "ABORTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for RpcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// A required request field is missing or out of range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The user (email or name) is already registered
    #[error("User already exists")]
    AlreadyExists,

    // =========================================================================
    // Credential Errors
    // =========================================================================
    /// Authentication failed. Deliberately does not say which check failed.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Recomputed password hash differs from the stored one
    #[error("Credential mismatch")]
    CredentialMismatch,

    /// A credential was set with an empty password
    #[error("Missing password")]
    EmptyPassword,

    /// Salt generation failed
    #[error("Random source failure")]
    RandomSourceFailure,

    // =========================================================================
    // Token Verification Errors
    // =========================================================================
    /// No token in the request URL or cookie
    #[error("Token absent")]
    TokenAbsent,

    /// An empty token was presented for verification
    #[error("JWT token missing")]
    MissingToken,

    /// The unsigned header could not be decoded, or carries no usable key id
    #[error("Malformed token header: {0}")]
    HeaderMalformed(String),

    /// The header declares an algorithm other than EdDSA
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The payload segment does not decode into claims
    #[error("Malformed token claims: {0}")]
    ClaimsMalformed(String),

    /// The signature does not verify under the key named in the header
    #[error("EdDSA verification failed")]
    SignatureInvalid,

    /// Signature valid but the expiry time has passed
    #[error("JWT expired")]
    TokenExpired,

    /// The key id in the header is unknown to the key authority
    #[error("Key ID not found")]
    KeyNotFound,

    /// The token carries none of the required audiences
    #[error("Token not valid for this audience")]
    InvalidAudience,

    /// The token's groups do not intersect the required groups
    #[error("Not member of any required group")]
    NotGroupMember,

    // =========================================================================
    // Time Budget Errors
    // =========================================================================
    /// The call deadline has passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Less time remains than the next step needs
    #[error("Not enough time in context")]
    InsufficientBudget,

    /// The call was canceled by the caller
    #[error("Canceled")]
    Canceled,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// A remote call failed for a reason unrelated to token validity
    #[error("Communication failure: {0}")]
    CommunicationFailure(String),

    /// Database error
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// Key generation failed
    #[error("Cryptographic failure: {0}")]
    CryptoFailure(String),

    /// Token signing failed
    #[error("JWT error: {0}")]
    SigningFailure(String),

    /// The RPC is not served by this implementation
    #[error("Method {0} not implemented")]
    Unimplemented(&'static str),

    /// Internal error (should not be exposed to clients)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Error reported by a remote authenticator
    #[error("Remote error {code}: {message}")]
    Remote {
        /// Status code returned by the remote side
        code: RpcCode,
        /// Client-safe message returned by the remote side
        message: String,
    },
}

impl AuthError {
    /// Exhaustive mapping onto the RPC status codes
    pub fn rpc_code(&self) -> RpcCode {
        match self {
            Self::InvalidArgument(_) | Self::EmptyPassword | Self::MissingToken => {
                RpcCode::InvalidArgument
            }

            Self::InvalidCredentials
            | Self::CredentialMismatch
            | Self::TokenAbsent
            | Self::HeaderMalformed(_)
            | Self::UnsupportedAlgorithm(_)
            | Self::ClaimsMalformed(_)
            | Self::SignatureInvalid
            | Self::TokenExpired
            | Self::InvalidAudience => RpcCode::Unauthenticated,

            Self::NotGroupMember => RpcCode::PermissionDenied,
            Self::KeyNotFound => RpcCode::NotFound,
            Self::AlreadyExists => RpcCode::AlreadyExists,
            Self::InsufficientBudget => RpcCode::Aborted,
            Self::DeadlineExceeded => RpcCode::DeadlineExceeded,
            Self::Canceled => RpcCode::Cancelled,
            Self::CommunicationFailure(_) => RpcCode::Unavailable,
            Self::Unimplemented(_) => RpcCode::Unimplemented,

            Self::RandomSourceFailure
            | Self::StorageFailure(_)
            | Self::CryptoFailure(_)
            | Self::SigningFailure(_)
            | Self::Internal(_) => RpcCode::Internal,

            Self::Remote { code, .. } => *code,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        self.rpc_code().status_code()
    }

    /// Get an error code for the client (safe to expose)
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidCredentials | Self::CredentialMismatch => "INVALID_CREDENTIALS",
            Self::EmptyPassword => "MISSING_PASSWORD",
            Self::TokenAbsent => "TOKEN_ABSENT",
            Self::MissingToken => "MISSING_TOKEN",
            Self::HeaderMalformed(_) => "HEADER_MALFORMED",
            Self::UnsupportedAlgorithm(_) => "UNSUPPORTED_ALGORITHM",
            Self::ClaimsMalformed(_) => "CLAIMS_MALFORMED",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::InvalidAudience => "INVALID_AUDIENCE",
            Self::NotGroupMember => "NOT_GROUP_MEMBER",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::InsufficientBudget => "INSUFFICIENT_BUDGET",
            Self::Canceled => "CANCELED",
            Self::CommunicationFailure(_) => "COMMUNICATION_FAILURE",
            Self::StorageFailure(_) => "STORAGE_FAILURE",
            Self::Unimplemented(_) => "UNIMPLEMENTED",
            Self::RandomSourceFailure
            | Self::CryptoFailure(_)
            | Self::SigningFailure(_)
            | Self::Internal(_) => "INTERNAL_ERROR",
            Self::Remote { code, .. } => code.as_str(),
        }
    }

    /// Errors a user can remedy by logging in again.
    pub fn is_verification_error(&self) -> bool {
        matches!(
            self,
            Self::TokenAbsent
                | Self::MissingToken
                | Self::HeaderMalformed(_)
                | Self::UnsupportedAlgorithm(_)
                | Self::ClaimsMalformed(_)
                | Self::SignatureInvalid
                | Self::TokenExpired
                | Self::KeyNotFound
                | Self::InvalidAudience
                | Self::NotGroupMember
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }

    /// Get safe message for client (doesn't leak internal details)
    pub fn client_message(&self) -> String {
        match self {
            // Never reveal which credential check failed
            Self::CredentialMismatch => Self::InvalidCredentials.to_string(),
            Self::StorageFailure(_) => "Database error".to_string(),
            Self::CommunicationFailure(_) => "Upstream communication error".to_string(),
            Self::RandomSourceFailure
            | Self::CryptoFailure(_)
            | Self::SigningFailure(_)
            | Self::Internal(_) => "An internal error occurred".to_string(),
            Self::HeaderMalformed(_) => "Invalid token header".to_string(),
            Self::ClaimsMalformed(_) => "Invalid token claims".to_string(),
            Self::Remote { message, .. } => message.clone(),
            _ => self.to_string(),
        }
    }
}

/// Error response for RPC clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// RPC status code (machine-readable)
    pub code: RpcCode,
    /// Finer grained error code (machine-readable)
    pub error: String,
    /// Error message (human-readable)
    pub message: String,
}

impl From<&AuthError> for ErrorResponse {
    fn from(error: &AuthError) -> Self {
        Self {
            code: error.rpc_code(),
            error: error.error_code().to_string(),
            message: error.client_message(),
        }
    }
}

impl From<ErrorResponse> for AuthError {
    fn from(response: ErrorResponse) -> Self {
        Self::Remote {
            code: response.code,
            message: response.message,
        }
    }
}

impl From<DbError> for AuthError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Duplicate(_) => Self::AlreadyExists,
            other => Self::StorageFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_codes() {
        assert_eq!(AuthError::InvalidCredentials.rpc_code(), RpcCode::Unauthenticated);
        assert_eq!(AuthError::KeyNotFound.rpc_code(), RpcCode::NotFound);
        assert_eq!(
            AuthError::InvalidArgument("kid".to_string()).rpc_code(),
            RpcCode::InvalidArgument
        );
        assert_eq!(AuthError::InsufficientBudget.rpc_code(), RpcCode::Aborted);
        assert_eq!(AuthError::DeadlineExceeded.rpc_code(), RpcCode::DeadlineExceeded);
        assert_eq!(
            AuthError::StorageFailure("boom".to_string()).rpc_code(),
            RpcCode::Internal
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::InvalidCredentials.status_code(), 401);
        assert_eq!(AuthError::NotGroupMember.status_code(), 403);
        assert_eq!(AuthError::KeyNotFound.status_code(), 404);
        assert_eq!(AuthError::AlreadyExists.status_code(), 409);
        assert_eq!(
            AuthError::CommunicationFailure("refused".to_string()).status_code(),
            503
        );
        assert_eq!(AuthError::Internal("test".to_string()).status_code(), 500);
    }

    #[test]
    fn test_credential_errors_are_indistinguishable() {
        let missing_user = ErrorResponse::from(&AuthError::InvalidCredentials);
        let wrong_password = ErrorResponse::from(&AuthError::CredentialMismatch);
        assert_eq!(missing_user, wrong_password);
    }

    #[test]
    fn test_client_message_hides_internal_details() {
        let err = AuthError::StorageFailure("connection string with password".to_string());
        assert!(!err.client_message().contains("password"));
        assert_eq!(err.client_message(), "Database error");

        let err = AuthError::CommunicationFailure("10.0.0.3:8765 refused".to_string());
        assert!(!err.client_message().contains("10.0.0.3"));
    }

    #[test]
    fn test_verification_family() {
        assert!(AuthError::TokenExpired.is_verification_error());
        assert!(AuthError::SignatureInvalid.is_verification_error());
        assert!(AuthError::KeyNotFound.is_verification_error());
        assert!(AuthError::HeaderMalformed("kid".to_string()).is_verification_error());
        assert!(!AuthError::CommunicationFailure("x".to_string()).is_verification_error());
        assert!(!AuthError::Internal("x".to_string()).is_verification_error());
    }

    #[test]
    fn test_remote_round_trip_keeps_code() {
        let response = ErrorResponse::from(&AuthError::KeyNotFound);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"NOT_FOUND\""));

        let back: ErrorResponse = serde_json::from_str(&json).unwrap();
        let err = AuthError::from(back);
        assert_eq!(err.rpc_code(), RpcCode::NotFound);
        assert_eq!(err.client_message(), "Key ID not found");
    }

    #[test]
    fn test_db_error_conversion() {
        let err = AuthError::from(DbError::Duplicate("email".to_string()));
        assert!(matches!(err, AuthError::AlreadyExists));

        let err = AuthError::from(DbError::Unavailable("down".to_string()));
        assert!(matches!(err, AuthError::StorageFailure(_)));
    }
}
