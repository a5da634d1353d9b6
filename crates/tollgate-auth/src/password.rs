//! Password credentials
//!
//! Salted Argon2id hashes stored as raw bytes next to their salt:
//! - Fixed KDF parameters from [`PasswordConfig`]
//! - Salts drawn from a caller-supplied random source
//! - Hashing on the blocking pool, never on a runtime worker
//! - Constant-time comparison to prevent timing attacks

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::PasswordConfig;
use crate::error::{AuthError, AuthResult};
use crate::transaction::RequestTransaction;

/// Deterministic key derivation over password and salt.
pub trait Kdf: Send + Sync {
    fn derive(&self, password: &[u8], salt: &[u8]) -> AuthResult<Vec<u8>>;
}

/// Argon2id with fixed parameters
#[derive(Clone)]
pub struct Argon2Kdf {
    params: Params,
}

impl Argon2Kdf {
    pub fn new(config: &PasswordConfig) -> AuthResult<Self> {
        let params = Params::new(
            config.memory_cost,
            config.time_cost,
            config.parallelism,
            Some(config.hash_length as usize),
        )
        .map_err(|e| AuthError::Internal(format!("Invalid Argon2 params: {}", e)))?;
        Ok(Self { params })
    }
}

impl Kdf for Argon2Kdf {
    fn derive(&self, password: &[u8], salt: &[u8]) -> AuthResult<Vec<u8>> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());
        let mut output = vec![0u8; self.params.output_len().unwrap_or(Params::DEFAULT_OUTPUT_LEN)];
        argon2
            .hash_password_into(password, salt, &mut output)
            .map_err(|e| AuthError::Internal(format!("Argon2 hashing failed: {}", e)))?;
        Ok(output)
    }
}

/// Stores and checks salted password hashes
#[derive(Clone)]
pub struct CredentialStore {
    kdf: Arc<dyn Kdf>,
    salt_length: usize,
}

impl CredentialStore {
    /// Create a store hashing with Argon2id
    pub fn new(config: &PasswordConfig) -> AuthResult<Self> {
        Ok(Self::with_kdf(Arc::new(Argon2Kdf::new(config)?), config.salt_length))
    }

    pub fn with_kdf(kdf: Arc<dyn Kdf>, salt_length: usize) -> Self {
        Self { kdf, salt_length }
    }

    /// Derive the hash of `password` under `salt`
    pub async fn hash(&self, password: &str, salt: &[u8]) -> AuthResult<Vec<u8>> {
        let kdf = self.kdf.clone();
        let password = Zeroizing::new(password.as_bytes().to_vec());
        let salt = salt.to_vec();
        tokio::task::spawn_blocking(move || kdf.derive(&password, &salt))
            .await
            .map_err(|e| AuthError::Internal(format!("Hashing task failed: {}", e)))?
    }

    /// Fresh random salt of the configured length
    pub fn generate_salt<R>(&self, rng: &mut R) -> AuthResult<Vec<u8>>
    where
        R: RngCore + CryptoRng + ?Sized,
    {
        let mut salt = vec![0u8; self.salt_length];
        rng.try_fill_bytes(&mut salt).map_err(|e| {
            warn!(error = %e, "Salt generation failed");
            AuthError::RandomSourceFailure
        })?;
        Ok(salt)
    }

    /// Replace the credential of `user_id` with a hash of `password` under a new salt
    pub async fn set_credential<R>(
        &self,
        tx: &mut RequestTransaction,
        user_id: i32,
        password: &str,
        rng: &mut R,
    ) -> AuthResult<()>
    where
        R: RngCore + CryptoRng + Send + ?Sized,
    {
        if password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }
        let salt = self.generate_salt(rng)?;
        let hash = self.hash(password, &salt).await?;
        tx.run("upsert password", |t| t.upsert_password(user_id, &salt, &hash))
            .await?;
        debug!(user_id, "Credential stored");
        Ok(())
    }

    /// Recompute the hash of `candidate` and compare it in full
    pub async fn verify(&self, stored_hash: &[u8], salt: &[u8], candidate: &str) -> AuthResult<()> {
        let derived = self.hash(candidate, salt).await?;
        if bool::from(derived.as_slice().ct_eq(stored_hash)) {
            Ok(())
        } else {
            Err(AuthError::CredentialMismatch)
        }
    }
}
