//! Authenticator service flows against the in-memory database

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use tollgate_auth::config::BootstrapUser;
use tollgate_auth::verify::{parse_header, verify_with_key};
use tollgate_auth::{
    AuthError, Authenticator, CallContext, CredentialStore, JwtConfig, KeyCache, KeyId,
    NewUserPassword, PasswordCredential, PublicUser, RegistrationData, RpcCode, Token,
    TokenIssuer, TokenVerifier, UserData, UserEmail, UserIdentifier, UserPassword,
    VerifierConfig,
};

use common::*;

fn login(user: UserIdentifier, password: &str) -> UserPassword {
    UserPassword {
        user,
        password: password.to_string(),
    }
}

#[tokio::test]
async fn test_register_then_authenticate() {
    let h = harness().await;
    let ctx = CallContext::background();

    let registration = h.register_alice().await;
    let err = h
        .service
        .refresh_token(&ctx, registration)
        .await
        .unwrap_err();
    // Registration tokens only prove the address
    assert!(matches!(err, AuthError::InvalidAudience));

    let token = h.login_alice().await;
    let verifier = TokenVerifier::new(
        Arc::new(KeyCache::new(h.authenticator())),
        &VerifierConfig::default(),
    );
    let claims = verifier.verify(&ctx, &token.jwt, Utc::now()).await.unwrap();
    assert_eq!(claims.sub, ALICE_EMAIL);
    assert_eq!(claims.iss, "localhost");
    assert_eq!(Some(claims.kid), h.keys.active_id());
    assert!(claims.user_id.is_some());
    assert!(claims.groups().is_empty());
    assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);

    // Login by name works as well
    let by_name = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Name("alice".into()), ALICE_PASSWORD))
        .await
        .unwrap();
    assert!(!by_name.jwt.is_empty());
}

#[tokio::test]
async fn test_registration_token_audience() {
    let h = harness().await;
    let token = h.register_alice().await;

    let kid = parse_header(&token.jwt).unwrap();
    let key = h.keys.active().unwrap();
    assert_eq!(kid, key.id());

    let claims = verify_with_key(
        &token.jwt,
        kid,
        key.public_key(),
        Utc::now(),
        &[h.service.verify_audience()],
    )
    .unwrap();
    assert_eq!(claims.aud, vec!["verify@localhost".to_string()]);
}

#[tokio::test]
async fn test_duplicate_registration() {
    let h = harness().await;
    h.register_alice().await;

    let err = h
        .service
        .register_pw_user(
            &CallContext::background(),
            RegistrationData {
                email: ALICE_EMAIL.to_string(),
                name: String::new(),
                password: "other".to_string(),
                url: None,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.rpc_code(), RpcCode::AlreadyExists);
}

#[tokio::test]
async fn test_register_requires_email() {
    let h = harness().await;
    let err = h
        .service
        .register_pw_user(
            &CallContext::background(),
            RegistrationData {
                email: String::new(),
                name: "bob".to_string(),
                password: "pw".to_string(),
                url: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(msg) if msg == "Missing email"));
}

#[tokio::test]
async fn test_bad_credentials_look_alike() {
    let h = harness().await;
    h.register_alice().await;
    let ctx = CallContext::background();

    let wrong_password = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Email(ALICE_EMAIL.into()), "nope"))
        .await
        .unwrap_err();
    let unknown_user = h
        .service
        .authenticate_pw_user(
            &ctx,
            login(UserIdentifier::Email("mallory@example.com".into()), ALICE_PASSWORD),
        )
        .await
        .unwrap_err();

    assert!(matches!(wrong_password, AuthError::InvalidCredentials));
    assert!(matches!(unknown_user, AuthError::InvalidCredentials));
    assert_eq!(wrong_password.client_message(), unknown_user.client_message());
    assert_eq!(wrong_password.status_code(), 401);
}

#[tokio::test]
async fn test_authenticate_argument_errors() {
    let h = harness().await;
    let ctx = CallContext::background();

    let err = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Email(ALICE_EMAIL.into()), ""))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(_)));

    let err = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Name(String::new()), "pw"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_check_user_exists() {
    let h = harness().await;
    h.register_alice().await;
    let ctx = CallContext::background();

    let exists = h
        .service
        .check_user_exists(
            &ctx,
            UserData {
                email: ALICE_EMAIL.to_string(),
                name: "bob".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(exists.email);
    assert!(!exists.name);

    let err = h
        .service
        .check_user_exists(&ctx, UserData::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_get_pub_key() {
    let h = harness().await;
    let ctx = CallContext::background();

    let err = h.service.get_pub_key(&ctx, KeyId { kid: 0 }).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(msg) if msg == "Public key ID missing"));

    let err = h.service.get_pub_key(&ctx, KeyId { kid: 999 }).await.unwrap_err();
    assert!(matches!(err, AuthError::KeyNotFound));
    assert_eq!(err.status_code(), 404);

    let active = h.keys.active().unwrap();
    let key = h
        .service
        .get_pub_key(&ctx, KeyId { kid: active.id() })
        .await
        .unwrap();
    assert_eq!(key.key.as_slice(), active.public_key());
}

#[tokio::test]
async fn test_expiry_boundary() {
    let h = harness().await;
    let issuer = TokenIssuer::new(
        h.keys.clone(),
        &JwtConfig {
            issuer: "localhost".to_string(),
            validity: Duration::from_secs(60),
        },
    )
    .unwrap();

    let issued_at = Utc::now();
    let token = issuer
        .issue("alice", Default::default(), Vec::new(), issued_at)
        .unwrap();
    let key = h.keys.active().unwrap();

    let at_expiry = issued_at + chrono::Duration::seconds(60);
    let result = verify_with_key(&token, key.id(), key.public_key(), at_expiry, &[]);
    assert!(matches!(result, Err(AuthError::TokenExpired)));

    let just_before = issued_at + chrono::Duration::seconds(59);
    assert!(verify_with_key(&token, key.id(), key.public_key(), just_before, &[]).is_ok());
}

#[tokio::test]
async fn test_tampered_token_rejected() {
    let h = harness().await;
    h.register_alice().await;
    let token = h.login_alice().await;

    let mut segments: Vec<String> = token.jwt.split('.').map(str::to_string).collect();
    let mut signature = segments[2].clone().into_bytes();
    signature[4] = if signature[4] == b'A' { b'B' } else { b'A' };
    segments[2] = String::from_utf8(signature).unwrap();
    let tampered = segments.join(".");

    let key = h.keys.active().unwrap();
    let result = verify_with_key(&tampered, key.id(), key.public_key(), Utc::now(), &[]);
    assert!(matches!(result, Err(AuthError::SignatureInvalid)));
}

#[tokio::test]
async fn test_rotation_keeps_old_tokens_valid() {
    let h = harness().await;
    h.register_alice().await;
    let old = h.login_alice().await;
    let old_kid = h.keys.active_id().unwrap();

    let new_kid = h
        .keys
        .rotate(&CallContext::background(), &mut OsRng)
        .await
        .unwrap();
    assert!(new_kid > old_kid);

    let fresh = h.login_alice().await;
    assert_eq!(parse_header(&fresh.jwt).unwrap(), new_kid);

    // Tokens from the previous key are still refreshed
    let refreshed = h
        .service
        .refresh_token(&CallContext::background(), old)
        .await
        .unwrap();
    assert_eq!(parse_header(&refreshed.jwt).unwrap(), new_kid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rotation_under_concurrent_issuance() {
    let h = harness().await;
    h.register_alice().await;

    let issuer = {
        let service = h.service.clone();
        tokio::spawn(async move {
            let mut tokens = Vec::new();
            for _ in 0..50 {
                let token = service
                    .public_user_token(
                        &CallContext::background(),
                        PublicUser {
                            uuid: uuid::Uuid::new_v4().to_string(),
                        },
                    )
                    .await
                    .unwrap();
                tokens.push(token.jwt);
                tokio::task::yield_now().await;
            }
            tokens
        })
    };
    for _ in 0..5 {
        h.keys
            .rotate(&CallContext::background(), &mut OsRng)
            .await
            .unwrap();
        tokio::task::yield_now().await;
    }
    let tokens = issuer.await.unwrap();

    // Every header kid names the key that actually signed the token
    let ctx = CallContext::background();
    for token in tokens {
        let kid = parse_header(&token).unwrap();
        let key = h.service.get_pub_key(&ctx, KeyId { kid }).await.unwrap();
        verify_with_key(&token, kid, &key.key, Utc::now(), &[]).unwrap();
    }
}

#[tokio::test]
async fn test_key_cache_fetches_once() {
    let h = harness().await;
    h.register_alice().await;
    let token = h.login_alice().await;

    let source = Arc::new(CountingKeySource::new(h.authenticator()));
    let cache = Arc::new(KeyCache::new(source.clone()));
    let verifier = TokenVerifier::new(cache.clone(), &VerifierConfig::default());
    let ctx = CallContext::background();

    verifier.verify(&ctx, &token.jwt, Utc::now()).await.unwrap();
    assert_eq!(source.lookups(), 1);

    verifier.verify(&ctx, &token.jwt, Utc::now()).await.unwrap();
    assert_eq!(source.lookups(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_verifier_audience_filter() {
    let h = harness().await;
    let token = h.register_alice().await;
    let ctx = CallContext::background();

    let verifier = TokenVerifier::new(
        Arc::new(KeyCache::new(h.authenticator())),
        &VerifierConfig {
            audiences: vec!["billing".to_string()],
        },
    );
    let err = verifier.verify(&ctx, &token.jwt, Utc::now()).await.unwrap_err();
    assert!(matches!(err, AuthError::InvalidAudience));
    assert!(err.is_verification_error());
}

#[tokio::test]
async fn test_hash_skipped_without_time_budget() {
    let kdf = Arc::new(CountingKdf::default());
    let h = harness_with(test_config(), {
        let kdf = kdf.clone();
        move |service| service.with_credentials(CredentialStore::with_kdf(kdf, 8))
    })
    .await;
    h.register_alice().await;
    assert_eq!(kdf.calls(), 1);

    // The default budget is one second; this call has far less
    let ctx = CallContext::with_timeout(Duration::from_millis(100));
    let err = h
        .service
        .authenticate_pw_user(
            &ctx,
            login(UserIdentifier::Email(ALICE_EMAIL.into()), ALICE_PASSWORD),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InsufficientBudget));
    assert_eq!(err.rpc_code(), RpcCode::Aborted);
    assert_eq!(kdf.calls(), 1);

    h.login_alice().await;
    assert_eq!(kdf.calls(), 2);
}

#[tokio::test]
async fn test_canceled_call() {
    let h = harness().await;
    let ctx = CallContext::background();
    ctx.cancel();

    let err = h
        .service
        .check_user_exists(
            &ctx,
            UserData {
                email: ALICE_EMAIL.to_string(),
                name: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::StorageFailure(_) | AuthError::Canceled));
}

#[tokio::test]
async fn test_storage_unavailable() {
    let h = harness().await;
    h.register_alice().await;
    h.db.set_available(false);

    let err = h
        .service
        .authenticate_pw_user(
            &CallContext::background(),
            login(UserIdentifier::Email(ALICE_EMAIL.into()), ALICE_PASSWORD),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::StorageFailure(_)));
    assert_eq!(err.client_message(), "Database error");

    h.db.set_available(true);
    h.login_alice().await;
}

#[tokio::test]
async fn test_change_password_with_old_password() {
    let h = harness().await;
    h.register_alice().await;
    let ctx = CallContext::background();

    let reply = h
        .service
        .change_user_pw(
            &ctx,
            NewUserPassword {
                user: Some(UserIdentifier::Email(ALICE_EMAIL.into())),
                credential: PasswordCredential::OldPassword(ALICE_PASSWORD.to_string()),
                new_password: "new secret".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(reply.success);

    let old = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Email(ALICE_EMAIL.into()), ALICE_PASSWORD))
        .await
        .unwrap_err();
    assert!(matches!(old, AuthError::InvalidCredentials));
    h.service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Email(ALICE_EMAIL.into()), "new secret"))
        .await
        .unwrap();

    let err = h
        .service
        .change_user_pw(
            &ctx,
            NewUserPassword {
                user: Some(UserIdentifier::Email(ALICE_EMAIL.into())),
                credential: PasswordCredential::OldPassword("new secret".to_string()),
                new_password: String::new(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::EmptyPassword));
}

#[tokio::test]
async fn test_password_reset_flow() {
    let notifier = Arc::new(CapturingNotifier::default());
    let h = harness_with(test_config(), {
        let notifier = notifier.clone();
        move |service| service.with_notifier(notifier)
    })
    .await;
    h.register_alice().await;
    let ctx = CallContext::background();

    // Unknown addresses succeed silently
    let reply = h
        .service
        .reset_user_pw(
            &ctx,
            UserEmail {
                email: "nobody@example.com".to_string(),
                url: None,
            },
        )
        .await
        .unwrap();
    assert!(reply.success);
    assert_eq!(notifier.count(), 0);

    h.service
        .reset_user_pw(
            &ctx,
            UserEmail {
                email: ALICE_EMAIL.to_string(),
                url: None,
            },
        )
        .await
        .unwrap();
    let reset_token = notifier.last_link().unwrap();

    // A reset token is not a session token
    let err = h
        .service
        .refresh_token(&ctx, Token { jwt: reset_token.clone() })
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidAudience));

    h.service
        .change_user_pw(
            &ctx,
            NewUserPassword {
                user: None,
                credential: PasswordCredential::ResetToken(reset_token),
                new_password: "reset secret".to_string(),
            },
        )
        .await
        .unwrap();

    h.service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Email(ALICE_EMAIL.into()), "reset secret"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_session_token_cannot_reset_password() {
    let h = harness().await;
    h.register_alice().await;
    let session = h.login_alice().await;

    let err = h
        .service
        .change_user_pw(
            &CallContext::background(),
            NewUserPassword {
                user: None,
                credential: PasswordCredential::ResetToken(session.jwt),
                new_password: "hijack".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidAudience));
}

#[tokio::test]
async fn test_registration_link_notified() {
    let notifier = Arc::new(CapturingNotifier::default());
    let h = harness_with(test_config(), {
        let notifier = notifier.clone();
        move |service| service.with_notifier(notifier)
    })
    .await;

    let token = h
        .service
        .register_pw_user(
            &CallContext::background(),
            RegistrationData {
                email: "bob@example.com".to_string(),
                name: String::new(),
                password: "pw".to_string(),
                url: Some(tollgate_auth::CallbackUrl::new("https://app.example.com/verify")),
            },
        )
        .await
        .unwrap();

    assert_eq!(
        notifier.last_link().unwrap(),
        format!("https://app.example.com/verify?token={}", token.jwt)
    );
}

#[tokio::test]
async fn test_public_user_token() {
    let h = harness().await;
    let ctx = CallContext::background();

    let err = h
        .service
        .public_user_token(&ctx, PublicUser::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::InvalidArgument(msg) if msg == "UUID missing"));

    let uuid = uuid::Uuid::new_v4();
    let token = h
        .service
        .public_user_token(&ctx, PublicUser { uuid: uuid.to_string() })
        .await
        .unwrap();
    let key = h.keys.active().unwrap();
    let claims = verify_with_key(&token.jwt, key.id(), key.public_key(), Utc::now(), &[]).unwrap();
    assert_eq!(claims.sub, format!("public:{}", uuid));
    assert!(claims.user_id.is_none());
    assert!(claims.groups().is_empty());
}

#[tokio::test]
async fn test_public_user_token_keeps_identifier_as_given() {
    let h = harness().await;
    let ctx = CallContext::background();
    let key = h.keys.active().unwrap();

    for id in [
        "67E55044-10B1-426F-9247-BB680E5FE0C8",
        "67e5504410b1426f9247bb680e5fe0c8",
        "visitor-42",
    ] {
        let token = h
            .service
            .public_user_token(&ctx, PublicUser { uuid: id.to_string() })
            .await
            .unwrap();
        let claims =
            verify_with_key(&token.jwt, key.id(), key.public_key(), Utc::now(), &[]).unwrap();
        assert_eq!(claims.sub, format!("public:{}", id));
    }
}

#[tokio::test]
async fn test_bootstrap_users_carry_groups() {
    let h = harness().await;
    let ctx = CallContext::background();
    let admin = BootstrapUser {
        email: "admin@example.com".to_string(),
        name: Some("admin".to_string()),
        password: "admin pw".to_string(),
        groups: vec!["admin".to_string()],
        audiences: vec!["billing".to_string()],
    };

    h.service.bootstrap_users(&ctx, &[admin.clone()]).await.unwrap();
    // Running twice keeps the same user
    h.service.bootstrap_users(&ctx, &[admin]).await.unwrap();

    let token = h
        .service
        .authenticate_pw_user(&ctx, login(UserIdentifier::Name("admin".into()), "admin pw"))
        .await
        .unwrap();
    let key = h.keys.active().unwrap();
    let claims = verify_with_key(&token.jwt, key.id(), key.public_key(), Utc::now(), &[]).unwrap();
    assert_eq!(claims.groups(), ["admin".to_string()]);
    assert_eq!(claims.aud, vec!["billing".to_string()]);
}
