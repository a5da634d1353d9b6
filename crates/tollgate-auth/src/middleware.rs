//! Token guard middleware for Axum
//!
//! Gatekeeper for services that consume tokens:
//! - Extracts the token from the `jwt` query parameter (wins) or cookie
//! - Verifies it through a [`TokenVerifier`]
//! - Refreshes tokens close to expiry through the authenticator
//! - Enforces the required groups
//! - Hands the verified claims to handlers via [`VerifiedClaims`]
//!
//! Anything a user can fix by logging in again ends in a `303 See Other` to
//! the login page; any other failure is a bare `500`. The inner service is
//! never called on a failure branch.

use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, info};

use crate::config::{MiddlewareConfig, VerifierConfig};
use crate::context::CallContext;
use crate::error::AuthError;
use crate::rpc::Authenticator;
use crate::types::{Claims, Token};
use crate::verify::{KeyCache, TokenVerifier};

const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// Authentication middleware layer
#[derive(Clone)]
pub struct AuthLayer {
    guard: Arc<Guard>,
}

impl AuthLayer {
    /// Create a layer verifying with `verifier` and refreshing through `client`
    pub fn new(
        verifier: TokenVerifier,
        client: Arc<dyn Authenticator>,
        config: MiddlewareConfig,
    ) -> Self {
        Self {
            guard: Arc::new(Guard {
                verifier,
                client,
                config,
            }),
        }
    }

    /// Create a layer whose keys and refreshes both come from `client`
    pub fn with_client(
        client: Arc<dyn Authenticator>,
        verifier: &VerifierConfig,
        config: MiddlewareConfig,
    ) -> Self {
        let cache = Arc::new(KeyCache::new(client.clone()));
        Self::new(TokenVerifier::new(cache, verifier), client, config)
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// Authentication middleware service
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    guard: Arc<Guard>,
}

impl<S> Service<Request> for AuthMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let guard = self.guard.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let admitted = match guard.admit(&parts.uri, &parts.headers).await {
                Ok(admitted) => admitted,
                Err(response) => return Ok(response),
            };

            parts.extensions.insert(VerifiedClaims(admitted.claims));
            let mut response = inner.call(Request::from_parts(parts, body)).await?;
            if let Some(cookie) = admitted.cookie {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            Ok(response)
        })
    }
}

struct Admitted {
    claims: Claims,
    cookie: Option<HeaderValue>,
}

struct Guard {
    verifier: TokenVerifier,
    client: Arc<dyn Authenticator>,
    config: MiddlewareConfig,
}

impl Guard {
    /// Extract → verify → refresh when near expiry → authorize groups
    async fn admit(&self, uri: &Uri, headers: &HeaderMap) -> Result<Admitted, Response> {
        let ctx = CallContext::with_timeout(self.config.call_timeout);

        let (mut token, from_url) = match self.extract(uri, headers) {
            Some(found) => found,
            None => return Err(self.login_redirect(uri, &AuthError::TokenAbsent)),
        };
        let mut renew_cookie = from_url;

        let now = Utc::now();
        let mut claims = self.verify(&ctx, uri, &token, now).await?;
        debug!(sub = %claims.sub, kid = claims.kid, "Token verified");

        if self.near_expiry(&claims, now) {
            let refreshed = ctx
                .run(self.client.refresh_token(&ctx, Token { jwt: token.clone() }))
                .await
                .and_then(|reply| reply);
            match refreshed {
                Ok(reply) => {
                    claims = self.verify(&ctx, uri, &reply.jwt, now).await?;
                    token = reply.jwt;
                    renew_cookie = true;
                    info!(sub = %claims.sub, kid = claims.kid, "Token refreshed");
                }
                // The current token is still valid; carry on with it
                Err(e) => error!(error = %e, "Token refresh failed"),
            }
        }

        let required = &self.config.groups;
        if !required.is_empty() && !claims.is_member_of_any(required) {
            return Err(self.login_redirect(uri, &AuthError::NotGroupMember));
        }

        let cookie = if renew_cookie {
            Some(self.cookie(&token, claims.expires_at())?)
        } else {
            None
        };
        Ok(Admitted { claims, cookie })
    }

    async fn verify(
        &self,
        ctx: &CallContext,
        uri: &Uri,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Claims, Response> {
        match self.verifier.verify(ctx, token, now).await {
            Ok(claims) => Ok(claims),
            Err(e) if e.is_verification_error() => Err(self.login_redirect(uri, &e)),
            Err(e) => {
                error!(error = %e, "Token verification failed");
                Err(internal_error())
            }
        }
    }

    fn near_expiry(&self, claims: &Claims, now: DateTime<Utc>) -> bool {
        let window = i64::try_from(self.config.refresh_within.as_secs()).unwrap_or(i64::MAX);
        claims.exp.saturating_sub(now.timestamp()) < window
    }

    /// Token from the URL query (wins) or the cookie; the flag tells which.
    fn extract(&self, uri: &Uri, headers: &HeaderMap) -> Option<(String, bool)> {
        let name = self.config.token_name.as_str();
        if let Some(token) = query_pairs(uri)
            .filter(|(key, _)| *key == name)
            .filter_map(|(_, value)| urlencoding::decode(value).ok())
            .find(|value| !value.is_empty())
        {
            return Some((token.into_owned(), true));
        }
        cookie_value(headers, name).map(|token| (token, false))
    }

    /// `303` to `<login_url>?<redirect_key>=<server_address><path>[?<query without token>]`
    fn login_redirect(&self, uri: &Uri, reason: &AuthError) -> Response {
        info!(reason = %reason, path = uri.path(), "Login redirect");

        let name = self.config.token_name.as_str();
        let query: Vec<&str> = uri
            .query()
            .unwrap_or("")
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter(|pair| pair.split('=').next() != Some(name))
            .collect();
        let query = if query.is_empty() {
            String::new()
        } else {
            format!("?{}", query.join("&"))
        };

        let location = format!(
            "{}?{}={}{}{}",
            self.config.login_url,
            self.config.redirect_key,
            self.config.server_address,
            uri.path(),
            query
        );
        match HeaderValue::from_str(&location) {
            Ok(location) => (StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response(),
            Err(e) => {
                error!(error = %e, "Invalid login redirect");
                internal_error()
            }
        }
    }

    fn cookie(&self, token: &str, expires: DateTime<Utc>) -> Result<HeaderValue, Response> {
        let cookie = format!(
            "{}={}; Path=/; Expires={}",
            self.config.token_name,
            token,
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        );
        HeaderValue::from_str(&cookie).map_err(|e| {
            error!(error = %e, "Invalid token cookie");
            internal_error()
        })
    }
}

fn internal_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(INTERNAL_SERVER_ERROR))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn query_pairs(uri: &Uri) -> impl Iterator<Item = (&str, &str)> {
    uri.query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

// =============================================================================
// Axum Extractors
// =============================================================================

/// Claims of the token admitted by [`AuthMiddleware`]
#[derive(Debug, Clone)]
pub struct VerifiedClaims(pub Claims);

#[async_trait]
impl<S> FromRequestParts<S> for VerifiedClaims
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<VerifiedClaims>()
            .cloned()
            .ok_or_else(|| {
                error!("VerifiedClaims requested on a route without AuthLayer");
                internal_error()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs() {
        let uri: Uri = "/path?a=1&jwt=abc&flag".parse().unwrap();
        let pairs: Vec<_> = query_pairs(&uri).collect();
        assert_eq!(pairs, vec![("a", "1"), ("jwt", "abc"), ("flag", "")]);
    }

    #[test]
    fn test_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "other=value; jwt=cookie-token; more=stuff".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "jwt"), Some("cookie-token".to_string()));
        assert_eq!(cookie_value(&headers, "session"), None);
    }

    #[test]
    fn test_internal_error_body() {
        let response = internal_error();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
