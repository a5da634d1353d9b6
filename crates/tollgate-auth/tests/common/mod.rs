//! Shared fixtures for the integration suites

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tollgate_auth::{
    AuthConfig, AuthResult, AuthService, Authenticator, CallContext, Kdf, KeyId,
    NotificationKind, Notifier, PasswordConfig, PublicKey, RegistrationData, SigningKeyManager,
    Token, UserIdentifier, UserPassword,
};
use tollgate_db::{MemoryDb, MultiDb};

pub const ALICE_EMAIL: &str = "alice@example.com";
pub const ALICE_PASSWORD: &str = "hunter2";

/// Argon2 parameters cheap enough for tests
pub fn fast_password_config() -> PasswordConfig {
    PasswordConfig {
        memory_cost: 256,
        time_cost: 1,
        parallelism: 1,
        ..PasswordConfig::default()
    }
}

pub fn test_config() -> AuthConfig {
    AuthConfig {
        password: fast_password_config(),
        ..AuthConfig::default()
    }
}

pub struct Harness {
    pub db: MemoryDb,
    pub keys: Arc<SigningKeyManager>,
    pub service: Arc<AuthService>,
}

pub async fn harness() -> Harness {
    harness_with(test_config(), |service| service).await
}

pub async fn harness_with<F>(config: AuthConfig, customize: F) -> Harness
where
    F: FnOnce(AuthService) -> AuthService,
{
    let db = MemoryDb::new();
    let shared: Arc<dyn MultiDb> = Arc::new(db.clone());
    let keys = Arc::new(SigningKeyManager::new(shared.clone()));
    keys.initialize(&CallContext::background(), &mut OsRng)
        .await
        .unwrap();
    let service = AuthService::new(shared, keys.clone(), &config).unwrap();
    Harness {
        db,
        keys,
        service: Arc::new(customize(service)),
    }
}

impl Harness {
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        self.service.clone()
    }

    pub async fn register_alice(&self) -> Token {
        self.service
            .register_pw_user(
                &CallContext::background(),
                RegistrationData {
                    email: ALICE_EMAIL.to_string(),
                    name: "alice".to_string(),
                    password: ALICE_PASSWORD.to_string(),
                    url: None,
                },
            )
            .await
            .unwrap()
    }

    pub async fn login_alice(&self) -> Token {
        self.service
            .authenticate_pw_user(
                &CallContext::background(),
                UserPassword {
                    user: UserIdentifier::Email(ALICE_EMAIL.to_string()),
                    password: ALICE_PASSWORD.to_string(),
                },
            )
            .await
            .unwrap()
    }
}

/// Counts derivations and hashes by plain concatenation
#[derive(Default)]
pub struct CountingKdf {
    pub calls: AtomicUsize,
}

impl CountingKdf {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Kdf for CountingKdf {
    fn derive(&self, password: &[u8], salt: &[u8]) -> AuthResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok([password, salt].concat())
    }
}

/// Keeps every notification for inspection
#[derive(Default)]
pub struct CapturingNotifier {
    pub sent: Mutex<Vec<(NotificationKind, String, String)>>,
}

impl CapturingNotifier {
    pub fn last_link(&self) -> Option<String> {
        self.sent.lock().last().map(|(_, _, link)| link.clone())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn notify(&self, kind: NotificationKind, email: &str, link: &str) -> AuthResult<()> {
        self.sent
            .lock()
            .push((kind, email.to_string(), link.to_string()));
        Ok(())
    }
}

/// Forwards key lookups to a real authenticator and counts them
pub struct CountingKeySource {
    pub inner: Arc<dyn Authenticator>,
    pub lookups: AtomicUsize,
}

impl CountingKeySource {
    pub fn new(inner: Arc<dyn Authenticator>) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingKeySource {
    async fn get_pub_key(&self, ctx: &CallContext, req: KeyId) -> AuthResult<PublicKey> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.get_pub_key(ctx, req).await
    }

    async fn refresh_token(&self, ctx: &CallContext, req: Token) -> AuthResult<Token> {
        self.inner.refresh_token(ctx, req).await
    }
}
