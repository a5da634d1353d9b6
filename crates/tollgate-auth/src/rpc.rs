//! Authenticator RPC surface
//!
//! [`Authenticator`] is the request/response contract. It is served over HTTP
//! by [`router`] and consumed remotely through [`HttpAuthenticator`]:
//!
//! ```text
//! POST /authenticator.v1/<Method>     JSON request body
//! x-timeout-ms: <remaining budget>    becomes the handler's CallContext
//! 2xx → JSON reply                    error → ErrorResponse + status code
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::context::CallContext;
use crate::error::{AuthError, AuthResult, ErrorResponse};
use crate::types::{
    Exists, KeyId, NewUserPassword, PublicKey, PublicUser, RegistrationData, Success, Token,
    UserData, UserEmail, UserPassword,
};

/// Header carrying the caller's remaining time budget in milliseconds
pub const TIMEOUT_HEADER: &str = "x-timeout-ms";

/// Route prefix of every method
pub const SERVICE_PATH: &str = "/authenticator.v1";

/// The authenticator contract. Unimplemented methods report `Unimplemented`.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn register_pw_user(&self, _ctx: &CallContext, _req: RegistrationData) -> AuthResult<Token> {
        Err(AuthError::Unimplemented("RegisterPwUser"))
    }

    async fn authenticate_pw_user(&self, _ctx: &CallContext, _req: UserPassword) -> AuthResult<Token> {
        Err(AuthError::Unimplemented("AuthenticatePwUser"))
    }

    async fn change_user_pw(&self, _ctx: &CallContext, _req: NewUserPassword) -> AuthResult<Success> {
        Err(AuthError::Unimplemented("ChangeUserPw"))
    }

    async fn check_user_exists(&self, _ctx: &CallContext, _req: UserData) -> AuthResult<Exists> {
        Err(AuthError::Unimplemented("CheckUserExists"))
    }

    async fn refresh_token(&self, _ctx: &CallContext, _req: Token) -> AuthResult<Token> {
        Err(AuthError::Unimplemented("RefreshToken"))
    }

    async fn public_user_token(&self, _ctx: &CallContext, _req: PublicUser) -> AuthResult<Token> {
        Err(AuthError::Unimplemented("PublicUserToken"))
    }

    async fn get_pub_key(&self, _ctx: &CallContext, _req: KeyId) -> AuthResult<PublicKey> {
        Err(AuthError::Unimplemented("GetPubKey"))
    }

    async fn reset_user_pw(&self, _ctx: &CallContext, _req: UserEmail) -> AuthResult<Success> {
        Err(AuthError::Unimplemented("ResetUserPw"))
    }
}

// =============================================================================
// Server
// =============================================================================

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if self.is_server_error() {
            error!(error = %self, "RPC failed");
        } else {
            debug!(error = %self, "RPC rejected");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

#[derive(Clone)]
struct RpcState {
    service: Arc<dyn Authenticator>,
    default_timeout: Duration,
}

impl RpcState {
    fn context(&self, headers: &HeaderMap) -> CallContext {
        let timeout = headers
            .get(TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        CallContext::with_timeout(timeout)
    }
}

/// HTTP routes serving `service`; calls without a timeout header get `default_timeout`.
pub fn router(service: Arc<dyn Authenticator>, default_timeout: Duration) -> Router {
    let state = RpcState {
        service,
        default_timeout,
    };
    Router::new()
        .route(&format!("{}/RegisterPwUser", SERVICE_PATH), post(register_pw_user))
        .route(&format!("{}/AuthenticatePwUser", SERVICE_PATH), post(authenticate_pw_user))
        .route(&format!("{}/ChangeUserPw", SERVICE_PATH), post(change_user_pw))
        .route(&format!("{}/CheckUserExists", SERVICE_PATH), post(check_user_exists))
        .route(&format!("{}/RefreshToken", SERVICE_PATH), post(refresh_token))
        .route(&format!("{}/PublicUserToken", SERVICE_PATH), post(public_user_token))
        .route(&format!("{}/GetPubKey", SERVICE_PATH), post(get_pub_key))
        .route(&format!("{}/ResetUserPw", SERVICE_PATH), post(reset_user_pw))
        .with_state(state)
}

async fn register_pw_user(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<RegistrationData>,
) -> Result<Json<Token>, AuthError> {
    let ctx = state.context(&headers);
    state.service.register_pw_user(&ctx, req).await.map(Json)
}

async fn authenticate_pw_user(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<UserPassword>,
) -> Result<Json<Token>, AuthError> {
    let ctx = state.context(&headers);
    state.service.authenticate_pw_user(&ctx, req).await.map(Json)
}

async fn change_user_pw(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<NewUserPassword>,
) -> Result<Json<Success>, AuthError> {
    let ctx = state.context(&headers);
    state.service.change_user_pw(&ctx, req).await.map(Json)
}

async fn check_user_exists(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<UserData>,
) -> Result<Json<Exists>, AuthError> {
    let ctx = state.context(&headers);
    state.service.check_user_exists(&ctx, req).await.map(Json)
}

async fn refresh_token(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<Token>,
) -> Result<Json<Token>, AuthError> {
    let ctx = state.context(&headers);
    state.service.refresh_token(&ctx, req).await.map(Json)
}

async fn public_user_token(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<PublicUser>,
) -> Result<Json<Token>, AuthError> {
    let ctx = state.context(&headers);
    state.service.public_user_token(&ctx, req).await.map(Json)
}

async fn get_pub_key(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<KeyId>,
) -> Result<Json<PublicKey>, AuthError> {
    let ctx = state.context(&headers);
    state.service.get_pub_key(&ctx, req).await.map(Json)
}

async fn reset_user_pw(
    State(state): State<RpcState>,
    headers: HeaderMap,
    Json(req): Json<UserEmail>,
) -> Result<Json<Success>, AuthError> {
    let ctx = state.context(&headers);
    state.service.reset_user_pw(&ctx, req).await.map(Json)
}

// =============================================================================
// Client
// =============================================================================

/// Remote [`Authenticator`] reached over HTTP
#[derive(Clone)]
pub struct HttpAuthenticator {
    client: Client,
    base_url: String,
}

impl HttpAuthenticator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn call<Req, Resp>(&self, ctx: &CallContext, method: &str, req: &Req) -> AuthResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let url = format!("{}{}/{}", self.base_url, SERVICE_PATH, method);
        let mut request = self.client.post(url).json(req);
        if let Some(remaining) = ctx.remaining() {
            request = request
                .timeout(remaining)
                .header(TIMEOUT_HEADER, remaining.as_millis().to_string());
        }

        let response = ctx
            .run(request.send())
            .await?
            .map_err(|e| AuthError::CommunicationFailure(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status.is_success() {
            return ctx
                .run(response.json::<Resp>())
                .await?
                .map_err(|e| AuthError::CommunicationFailure(format!("{}: {}", method, e)));
        }

        match ctx.run(response.json::<ErrorResponse>()).await? {
            Ok(body) => Err(body.into()),
            Err(_) => Err(AuthError::CommunicationFailure(format!(
                "{}: HTTP {}",
                method, status
            ))),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn register_pw_user(&self, ctx: &CallContext, req: RegistrationData) -> AuthResult<Token> {
        self.call(ctx, "RegisterPwUser", &req).await
    }

    async fn authenticate_pw_user(&self, ctx: &CallContext, req: UserPassword) -> AuthResult<Token> {
        self.call(ctx, "AuthenticatePwUser", &req).await
    }

    async fn change_user_pw(&self, ctx: &CallContext, req: NewUserPassword) -> AuthResult<Success> {
        self.call(ctx, "ChangeUserPw", &req).await
    }

    async fn check_user_exists(&self, ctx: &CallContext, req: UserData) -> AuthResult<Exists> {
        self.call(ctx, "CheckUserExists", &req).await
    }

    async fn refresh_token(&self, ctx: &CallContext, req: Token) -> AuthResult<Token> {
        self.call(ctx, "RefreshToken", &req).await
    }

    async fn public_user_token(&self, ctx: &CallContext, req: PublicUser) -> AuthResult<Token> {
        self.call(ctx, "PublicUserToken", &req).await
    }

    async fn get_pub_key(&self, ctx: &CallContext, req: KeyId) -> AuthResult<PublicKey> {
        self.call(ctx, "GetPubKey", &req).await
    }

    async fn reset_user_pw(&self, ctx: &CallContext, req: UserEmail) -> AuthResult<Success> {
        self.call(ctx, "ResetUserPw", &req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    impl Authenticator for Empty {}

    #[tokio::test]
    async fn test_default_methods_are_unimplemented() {
        let ctx = CallContext::background();
        let err = Empty.get_pub_key(&ctx, KeyId { kid: 1 }).await.unwrap_err();
        assert!(matches!(err, AuthError::Unimplemented("GetPubKey")));
        assert_eq!(err.status_code(), 501);
    }

    #[test]
    fn test_timeout_header() {
        let state = RpcState {
            service: Arc::new(Empty),
            default_timeout: Duration::from_secs(30),
        };
        let mut headers = HeaderMap::new();
        headers.insert(TIMEOUT_HEADER, "250".parse().unwrap());
        let remaining = state.context(&headers).remaining().unwrap();
        assert!(remaining <= Duration::from_millis(250));

        let remaining = state.context(&HeaderMap::new()).remaining().unwrap();
        assert!(remaining > Duration::from_secs(25));
    }

    #[test]
    fn test_error_response_status() {
        let response = AuthError::KeyNotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = AuthError::InvalidCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
