//! Authenticator service
//!
//! Every handler runs the same state machine:
//!
//! ```text
//! begin(read_only) → domain logic → [commit] → reply
//!        └──────────── done() on every exit ────────────┘
//! ```
//!
//! Credential failures leave the service as one generic `InvalidCredentials`,
//! whatever the cause.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use tollgate_db::{DbUser, MultiDb};
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, BootstrapUser};
use crate::context::CallContext;
use crate::error::{AuthError, AuthResult};
use crate::jwt::TokenIssuer;
use crate::keys::SigningKeyManager;
use crate::notify::{LogNotifier, NotificationKind, Notifier};
use crate::password::CredentialStore;
use crate::rpc::Authenticator;
use crate::transaction::RequestTransaction;
use crate::types::{
    ClaimSet, Claims, Exists, KeyId, NewUserPassword, PasswordCredential, PublicKey, PublicUser,
    RegistrationData, Success, Token, UserData, UserEmail, UserIdentifier, UserPassword,
};
use crate::verify::{parse_header, verify_with_key};

const ERR_MISSING_EMAIL: &str = "Missing email";
const ERR_MISSING_EMAIL_OR_NAME: &str = "Missing email or name";
const ERR_MISSING_PASSWORD: &str = "Missing password";
const ERR_MISSING_UUID: &str = "UUID missing";
const ERR_MISSING_KEY_ID: &str = "Public key ID missing";

/// The identity provider behind the authenticator RPC surface
pub struct AuthService {
    db: Arc<dyn MultiDb>,
    issuer: TokenIssuer,
    credentials: CredentialStore,
    notifier: Arc<dyn Notifier>,
    hash_budget: Duration,
}

impl AuthService {
    /// Create the service with Argon2id credentials and a logging notifier
    pub fn new(
        db: Arc<dyn MultiDb>,
        keys: Arc<SigningKeyManager>,
        config: &AuthConfig,
    ) -> AuthResult<Self> {
        Ok(Self {
            db,
            issuer: TokenIssuer::new(keys, &config.jwt)?,
            credentials: CredentialStore::new(&config.password)?,
            notifier: Arc::new(LogNotifier),
            hash_budget: config.password.hash_budget,
        })
    }

    pub fn with_credentials(mut self, credentials: CredentialStore) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn keys(&self) -> &Arc<SigningKeyManager> {
        self.issuer.keys()
    }

    /// Audience of registration (address verification) tokens
    pub fn verify_audience(&self) -> String {
        format!("verify@{}", self.issuer.issuer())
    }

    /// Audience of password reset tokens
    pub fn reset_audience(&self) -> String {
        format!("passwords@{}", self.issuer.issuer())
    }

    /// Ensure each configured user exists with the given password and memberships.
    pub async fn bootstrap_users(&self, ctx: &CallContext, users: &[BootstrapUser]) -> AuthResult<()> {
        if users.is_empty() {
            return Ok(());
        }
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "Bootstrap", false).await?;
        let result = self.bootstrap(&mut tx, users).await;
        tx.done().await;
        result
    }

    async fn bootstrap(&self, tx: &mut RequestTransaction, users: &[BootstrapUser]) -> AuthResult<()> {
        for entry in users {
            let existing = tx
                .run("find user", |t| t.find_user_by_email(&entry.email))
                .await?;
            let user = match existing {
                Some(user) => user,
                None => {
                    let name = entry.name.as_deref().filter(|n| !n.is_empty());
                    tx.run("insert user", |t| t.insert_user(&entry.email, name))
                        .await?
                }
            };
            self.credentials
                .set_credential(tx, user.id, &entry.password, &mut OsRng)
                .await?;
            tx.run("set groups", |t| t.set_user_groups(user.id, &entry.groups))
                .await?;
            tx.run("set audiences", |t| t.set_user_audiences(user.id, &entry.audiences))
                .await?;
            info!(user_id = user.id, email = %entry.email, "Bootstrap user ready");
        }
        tx.commit().await
    }

    // =========================================================================
    // Shared steps
    // =========================================================================

    async fn find_user(tx: &mut RequestTransaction, user: &UserIdentifier) -> AuthResult<DbUser> {
        if user.value().is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_EMAIL_OR_NAME.to_string()));
        }
        let found = match user {
            UserIdentifier::Email(email) => {
                tx.run("find user", |t| t.find_user_by_email(email)).await?
            }
            UserIdentifier::Name(name) => {
                tx.run("find user", |t| t.find_user_by_name(name)).await?
            }
        };
        found.ok_or_else(|| {
            warn!(user = user.value(), "User not found");
            AuthError::InvalidCredentials
        })
    }

    /// Look up a token subject, by email first and by name second
    async fn find_subject(tx: &mut RequestTransaction, subject: &str) -> AuthResult<DbUser> {
        if let Some(user) = tx
            .run("find user", |t| t.find_user_by_email(subject))
            .await?
        {
            return Ok(user);
        }
        tx.run("find user", |t| t.find_user_by_name(subject))
            .await?
            .ok_or_else(|| {
                warn!(subject, "Token subject not found");
                AuthError::InvalidCredentials
            })
    }

    async fn authenticate(
        &self,
        tx: &mut RequestTransaction,
        user: &UserIdentifier,
        password: &str,
    ) -> AuthResult<DbUser> {
        if password.is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_PASSWORD.to_string()));
        }
        let user = Self::find_user(tx, user).await?;
        let stored = tx
            .run("find password", |t| t.find_password(user.id))
            .await?
            .ok_or_else(|| {
                warn!(user_id = user.id, "User has no password");
                AuthError::InvalidCredentials
            })?;

        // Hashing is the expensive step; give up first if it cannot finish in time
        tx.enough_time(self.hash_budget)?;

        match self.credentials.verify(&stored.hash, &stored.salt, password).await {
            Ok(()) => Ok(user),
            Err(AuthError::CredentialMismatch) => {
                warn!(user_id = user.id, "Password mismatch");
                Err(AuthError::InvalidCredentials)
            }
            Err(e) => Err(e),
        }
    }

    /// Verify a token against the key table of this service
    async fn check_token(
        tx: &mut RequestTransaction,
        token: &str,
        now: DateTime<Utc>,
        audiences: &[String],
    ) -> AuthResult<Claims> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let kid = parse_header(token)?;
        let key = tx
            .run("find jwt key", |t| t.find_jwt_key(kid))
            .await?
            .ok_or(AuthError::KeyNotFound)?;
        verify_with_key(token, kid, &key.public_key, now, audiences).map_err(|e| {
            warn!(kid, error = %e, "Token rejected");
            e
        })
    }

    /// Token carrying the user's current groups and audiences
    async fn user_token(
        &self,
        tx: &mut RequestTransaction,
        user: &DbUser,
        now: DateTime<Utc>,
    ) -> AuthResult<Token> {
        let groups = tx.run("user groups", |t| t.user_groups(user.id)).await?;
        let audiences = tx.run("user audiences", |t| t.user_audiences(user.id)).await?;
        debug!(user_id = user.id, ?groups, ?audiences, "Issuing user token");
        let jwt = self.issuer.issue(
            &user.email,
            ClaimSet::for_user(user.id, groups),
            audiences,
            now,
        )?;
        Ok(Token { jwt })
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn register(&self, tx: &mut RequestTransaction, req: RegistrationData) -> AuthResult<Token> {
        if req.email.is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_EMAIL.to_string()));
        }
        tx.enough_time(self.hash_budget)?;

        let name = (!req.name.is_empty()).then_some(req.name.as_str());
        let user = tx
            .run("insert user", |t| t.insert_user(&req.email, name))
            .await?;
        self.credentials
            .set_credential(tx, user.id, &req.password, &mut OsRng)
            .await?;

        let jwt = self.issuer.issue(
            &user.email,
            ClaimSet::default(),
            vec![self.verify_audience()],
            Utc::now(),
        )?;
        tx.commit().await?;
        info!(user_id = user.id, "User registered");

        if let Some(url) = &req.url {
            self.notifier
                .notify(NotificationKind::VerifyEmail, &user.email, &url.render(&jwt))
                .await?;
        }
        Ok(Token { jwt })
    }

    async fn change_password(
        &self,
        tx: &mut RequestTransaction,
        req: NewUserPassword,
    ) -> AuthResult<Success> {
        if req.new_password.is_empty() {
            return Err(AuthError::EmptyPassword);
        }

        let user = match &req.credential {
            PasswordCredential::OldPassword(password) => {
                let named = req.user.as_ref().ok_or_else(|| {
                    AuthError::InvalidArgument(ERR_MISSING_EMAIL_OR_NAME.to_string())
                })?;
                self.authenticate(tx, named, password).await?
            }
            PasswordCredential::ResetToken(token) => {
                let claims =
                    Self::check_token(tx, token, Utc::now(), &[self.reset_audience()]).await?;
                let user = Self::find_subject(tx, &claims.sub).await?;
                if let Some(named) = &req.user {
                    if Self::find_user(tx, named).await?.id != user.id {
                        warn!(user_id = user.id, "Reset token names another user");
                        return Err(AuthError::InvalidCredentials);
                    }
                }
                user
            }
        };

        tx.enough_time(self.hash_budget)?;
        self.credentials
            .set_credential(tx, user.id, &req.new_password, &mut OsRng)
            .await?;
        tx.commit().await?;
        info!(user_id = user.id, "Password changed");
        Ok(Success { success: true })
    }

    async fn exists(tx: &mut RequestTransaction, req: UserData) -> AuthResult<Exists> {
        if req.email.is_empty() && req.name.is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_EMAIL_OR_NAME.to_string()));
        }
        let mut exists = Exists::default();
        if !req.email.is_empty() {
            exists.email = tx
                .run("find user", |t| t.find_user_by_email(&req.email))
                .await?
                .is_some();
        }
        if !req.name.is_empty() {
            exists.name = tx
                .run("find user", |t| t.find_user_by_name(&req.name))
                .await?
                .is_some();
        }
        Ok(exists)
    }

    async fn refresh(&self, tx: &mut RequestTransaction, req: Token) -> AuthResult<Token> {
        let now = Utc::now();
        let claims = Self::check_token(tx, &req.jwt, now, &[]).await?;

        // Single-purpose tokens never turn into session tokens
        if claims.has_audience(&self.verify_audience()) || claims.has_audience(&self.reset_audience()) {
            warn!(kid = claims.kid, "Refresh with a single-purpose token");
            return Err(AuthError::InvalidAudience);
        }

        let user = Self::find_subject(tx, &claims.sub).await?;
        self.user_token(tx, &user, now).await
    }

    async fn reset(&self, tx: &mut RequestTransaction, req: UserEmail) -> AuthResult<Success> {
        if req.email.is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_EMAIL.to_string()));
        }
        let user = tx
            .run("find user", |t| t.find_user_by_email(&req.email))
            .await?;

        // Unknown addresses get the same reply as known ones
        let Some(user) = user else {
            warn!(email = %req.email, "Password reset for unknown user");
            return Ok(Success { success: true });
        };

        let custom = ClaimSet {
            user_id: Some(user.id),
            ..ClaimSet::default()
        };
        let jwt = self
            .issuer
            .issue(&user.email, custom, vec![self.reset_audience()], Utc::now())?;
        let link = match &req.url {
            Some(url) => url.render(&jwt),
            None => jwt,
        };
        self.notifier
            .notify(NotificationKind::ResetPassword, &user.email, &link)
            .await?;
        info!(user_id = user.id, "Password reset issued");
        Ok(Success { success: true })
    }
}

#[async_trait]
impl Authenticator for AuthService {
    async fn register_pw_user(&self, ctx: &CallContext, req: RegistrationData) -> AuthResult<Token> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "RegisterPwUser", false).await?;
        let result = self.register(&mut tx, req).await;
        tx.done().await;
        result
    }

    async fn authenticate_pw_user(&self, ctx: &CallContext, req: UserPassword) -> AuthResult<Token> {
        let mut tx =
            RequestTransaction::begin(self.db.as_ref(), ctx, "AuthenticatePwUser", true).await?;
        let result = async {
            let user = self.authenticate(&mut tx, &req.user, &req.password).await?;
            self.user_token(&mut tx, &user, Utc::now()).await
        }
        .await;
        tx.done().await;
        result
    }

    async fn change_user_pw(&self, ctx: &CallContext, req: NewUserPassword) -> AuthResult<Success> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "ChangeUserPw", false).await?;
        let result = self.change_password(&mut tx, req).await;
        tx.done().await;
        result
    }

    async fn check_user_exists(&self, ctx: &CallContext, req: UserData) -> AuthResult<Exists> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "CheckUserExists", true).await?;
        let result = Self::exists(&mut tx, req).await;
        tx.done().await;
        result
    }

    async fn refresh_token(&self, ctx: &CallContext, req: Token) -> AuthResult<Token> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "RefreshToken", true).await?;
        let result = self.refresh(&mut tx, req).await;
        tx.done().await;
        result
    }

    async fn public_user_token(&self, ctx: &CallContext, req: PublicUser) -> AuthResult<Token> {
        if req.uuid.is_empty() {
            return Err(AuthError::InvalidArgument(ERR_MISSING_UUID.to_string()));
        }

        // The identifier is the caller's, signed as given
        let tx = RequestTransaction::begin(self.db.as_ref(), ctx, "PublicUserToken", true).await?;
        let result = self.issuer.issue(
            &format!("public:{}", req.uuid),
            ClaimSet::default(),
            Vec::new(),
            Utc::now(),
        );
        tx.done().await;
        Ok(Token { jwt: result? })
    }

    async fn get_pub_key(&self, ctx: &CallContext, req: KeyId) -> AuthResult<PublicKey> {
        if req.kid <= 0 {
            return Err(AuthError::InvalidArgument(ERR_MISSING_KEY_ID.to_string()));
        }
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "GetPubKey", true).await?;
        let result = tx.run("find jwt key", |t| t.find_jwt_key(req.kid)).await;
        tx.done().await;
        match result? {
            Some(key) => Ok(PublicKey { key: key.public_key }),
            None => {
                warn!(kid = req.kid, "Public key not found");
                Err(AuthError::KeyNotFound)
            }
        }
    }

    async fn reset_user_pw(&self, ctx: &CallContext, req: UserEmail) -> AuthResult<Success> {
        let mut tx = RequestTransaction::begin(self.db.as_ref(), ctx, "ResetUserPw", true).await?;
        let result = self.reset(&mut tx, req).await;
        tx.done().await;
        result
    }
}
