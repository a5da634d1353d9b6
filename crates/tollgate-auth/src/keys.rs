//! Signing key lifecycle
//!
//! The manager holds exactly one active Ed25519 keypair. Rotation generates a
//! new keypair, persists its public half (storage assigns the key id) and only
//! then swaps the in-memory slot. Previous public keys stay in storage so that
//! tokens signed before a rotation keep verifying until they expire. Private
//! keys never leave process memory.

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use jsonwebtoken::EncodingKey;
use parking_lot::RwLock;
use rand::{CryptoRng, RngCore};
use tollgate_db::{DbJwtKey, MultiDb};
use tracing::{error, info};
use zeroize::Zeroizing;

use crate::context::CallContext;
use crate::error::{AuthError, AuthResult};
use crate::transaction::RequestTransaction;

/// PKCS#8 v1 prefix for a raw 32-byte Ed25519 seed
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the seed)
];

/// Snapshot of the active keypair
pub struct ActiveKey {
    id: i32,
    encoding_key: EncodingKey,
    public_key: [u8; 32],
}

impl ActiveKey {
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }
}

impl std::fmt::Debug for ActiveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveKey")
            .field("id", &self.id)
            .field("encoding_key", &"<redacted>")
            .finish()
    }
}

/// Owner of the active signing keypair
pub struct SigningKeyManager {
    db: Arc<dyn MultiDb>,
    active: RwLock<Option<Arc<ActiveKey>>>,
}

impl SigningKeyManager {
    pub fn new(db: Arc<dyn MultiDb>) -> Self {
        Self {
            db,
            active: RwLock::new(None),
        }
    }

    /// Rotate once unless a key is already active
    pub async fn initialize<R>(&self, ctx: &CallContext, rng: &mut R) -> AuthResult<i32>
    where
        R: RngCore + CryptoRng + Send + ?Sized,
    {
        if let Some(id) = self.active_id() {
            return Ok(id);
        }
        self.rotate(ctx, rng).await
    }

    /// Generate, persist and activate a new keypair; returns its id.
    ///
    /// On any failure the previous key stays active.
    pub async fn rotate<R>(&self, ctx: &CallContext, rng: &mut R) -> AuthResult<i32>
    where
        R: RngCore + CryptoRng + Send + ?Sized,
    {
        let mut seed = Zeroizing::new([0u8; 32]);
        rng.try_fill_bytes(&mut seed[..]).map_err(|e| {
            error!(error = %e, "Key generation failed");
            AuthError::CryptoFailure(e.to_string())
        })?;
        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = signing_key.verifying_key().to_bytes();

        let mut der = Zeroizing::new(Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32));
        der.extend_from_slice(&ED25519_PKCS8_PREFIX);
        der.extend_from_slice(&seed[..]);
        let encoding_key = EncodingKey::from_ed_der(&der);

        let stored = self.persist(ctx, &public_key).await?;

        let key = Arc::new(ActiveKey {
            id: stored.id,
            encoding_key,
            public_key,
        });
        *self.active.write() = Some(key);
        info!(kid = stored.id, "Signing key rotated");
        Ok(stored.id)
    }

    async fn persist(&self, ctx: &CallContext, public_key: &[u8]) -> AuthResult<DbJwtKey> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "RotateKey", false).await?;
        let stored = async {
            let key = tx
                .run("insert jwt key", |t| t.insert_jwt_key(public_key))
                .await?;
            tx.commit().await?;
            Ok::<_, AuthError>(key)
        }
        .await;
        tx.done().await;
        stored.map_err(|e| match e {
            AuthError::StorageFailure(_) => e,
            other => AuthError::StorageFailure(other.to_string()),
        })
    }

    /// Snapshot of the active keypair; never blocks on I/O.
    pub fn active(&self) -> AuthResult<Arc<ActiveKey>> {
        self.active
            .read()
            .clone()
            .ok_or_else(|| AuthError::Internal("no active signing key".to_string()))
    }

    pub fn active_id(&self) -> Option<i32> {
        self.active.read().as_ref().map(|key| key.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use tollgate_db::MemoryDb;

    struct FailingRng;

    impl RngCore for FailingRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, _dest: &mut [u8]) {}
        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> {
            Err(rand::Error::new("no entropy"))
        }
    }

    impl CryptoRng for FailingRng {}

    #[tokio::test]
    async fn test_rotate_persists_public_key() {
        let db = MemoryDb::new();
        let keys = SigningKeyManager::new(Arc::new(db.clone()));
        let ctx = CallContext::background();

        assert!(keys.active().is_err());
        let first = keys.rotate(&ctx, &mut OsRng).await.unwrap();
        let second = keys.rotate(&ctx, &mut OsRng).await.unwrap();
        assert_ne!(first, second);

        let active = keys.active().unwrap();
        assert_eq!(active.id(), second);

        let mut tx = RequestTransaction::begin(&db, &ctx, "Test", true).await.unwrap();
        let stored = tx
            .run("find jwt key", |t| t.find_jwt_key(second))
            .await
            .unwrap()
            .unwrap();
        let old = tx.run("find jwt key", |t| t.find_jwt_key(first)).await.unwrap();
        tx.done().await;
        assert_eq!(stored.public_key, active.public_key().to_vec());
        assert!(old.is_some());
    }

    #[tokio::test]
    async fn test_failed_persistence_keeps_previous_key() {
        let db = MemoryDb::new();
        let keys = SigningKeyManager::new(Arc::new(db.clone()));
        let ctx = CallContext::background();
        let first = keys.rotate(&ctx, &mut OsRng).await.unwrap();

        db.set_available(false);
        let result = keys.rotate(&ctx, &mut OsRng).await;
        assert!(matches!(result, Err(AuthError::StorageFailure(_))));
        assert_eq!(keys.active_id(), Some(first));
    }

    #[tokio::test]
    async fn test_failed_generation_keeps_previous_key() {
        let db = MemoryDb::new();
        let keys = SigningKeyManager::new(Arc::new(db));
        let ctx = CallContext::background();
        let first = keys.initialize(&ctx, &mut OsRng).await.unwrap();

        let result = keys.rotate(&ctx, &mut FailingRng).await;
        assert!(matches!(result, Err(AuthError::CryptoFailure(_))));
        assert_eq!(keys.active_id(), Some(first));

        // initialize is idempotent once a key is active
        assert_eq!(keys.initialize(&ctx, &mut OsRng).await.unwrap(), first);
    }
}
