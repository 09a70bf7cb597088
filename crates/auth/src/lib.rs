mod authenticator;
mod config;
mod error;
mod keystore;
mod scope;

pub use authenticator::{JwtAuthenticator, MIN_KID_MISS_REFRESH_INTERVAL, Verdict, VerifiedToken};
pub use config::{AuthenticationConfig, DEFAULT_JWKS_MAX_WAIT_MS, DEFAULT_JWKS_TTL_SECS};
pub use error::{AuthError, Rejection};
pub use keystore::{KeyEntry, KeySet, KeyStore};
pub use scope::{SCOPE_CLAIMS, ScopeStrategy, ScopeStrategyKind, token_scopes};

use http::HeaderMap;
use http::header;

/// Extracts the bearer token from `Authorization`. A missing header is not an
/// error; whether a token is required depends on the route.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<String>, Rejection> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let authz = value
        .to_str()
        .map(str::trim)
        .map_err(|_| Rejection::TokenMalformed("Authorization header is not ASCII".to_string()))?;
    if authz.is_empty() {
        return Ok(None);
    }

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| {
            Rejection::TokenMalformed("Authorization must be a Bearer token".to_string())
        })?
        .trim();

    if token.is_empty() {
        return Err(Rejection::TokenMalformed("Bearer token is empty".to_string()));
    }

    Ok(Some(token.to_string()))
}
