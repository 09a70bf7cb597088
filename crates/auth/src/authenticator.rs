use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header};
use reqwest::Url;
use serde_json::Value;

use crate::config::AuthenticationConfig;
use crate::error::{AuthError, Rejection};
use crate::keystore::{KeySet, KeyStore};
use crate::scope::{ScopeStrategy, token_scopes};

/// A kid miss only forces a refresh once the cached set is at least this old.
pub const MIN_KID_MISS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedToken {
    pub claims: Value,
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid(VerifiedToken),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid(_))
    }
}

#[derive(Clone)]
pub struct JwtAuthenticator {
    alias: String,
    config: AuthenticationConfig,
    algorithms: Vec<Algorithm>,
    scope_strategy: Option<Arc<dyn ScopeStrategy>>,
    key_store: KeyStore,
}

impl JwtAuthenticator {
    /// Validates `config` and builds the key store without touching the
    /// network.
    pub fn new(config: AuthenticationConfig, alias: &str) -> Result<Self, AuthError> {
        if alias.trim().is_empty() {
            return Err(AuthError::InvalidConfig(
                "authentication policy alias must be non-empty".to_string(),
            ));
        }

        let mut algorithms = Vec::with_capacity(config.allowed_algorithms.len());
        for name in &config.allowed_algorithms {
            let alg = Algorithm::from_str(name.trim()).map_err(|_| {
                AuthError::InvalidConfig(format!(
                    "policy `{}`: unknown signing algorithm `{}`",
                    alias, name
                ))
            })?;
            algorithms.push(alg);
        }

        // Valid config; the key set is empty and every token is rejected.
        if config.jwks_urls.is_empty() {
            tracing::warn!(policy = alias, "no jwks urls configured; tokens cannot be verified");
        }

        let mut sources = Vec::with_capacity(config.jwks_urls.len());
        for raw in &config.jwks_urls {
            let url = Url::parse(raw.trim()).map_err(|err| {
                AuthError::InvalidConfig(format!(
                    "policy `{}`: invalid jwks url `{}`: {}",
                    alias, raw, err
                ))
            })?;
            sources.push(url);
        }

        let key_store = KeyStore::new(
            alias,
            sources,
            config.jwks_ttl(),
            config.jwks_max_wait(),
        )?;

        let scope_strategy = config
            .scope_strategy
            .map(|kind| Arc::new(kind) as Arc<dyn ScopeStrategy>);

        Ok(Self {
            alias: alias.to_string(),
            config,
            algorithms,
            scope_strategy,
            key_store,
        })
    }

    /// Like [`JwtAuthenticator::new`], then warms the key set. A failed warm-up
    /// is logged and retried on first use.
    pub async fn configure(config: AuthenticationConfig, alias: &str) -> Result<Self, AuthError> {
        let authenticator = Self::new(config, alias)?;
        match authenticator.key_store.key_set().await {
            Ok(set) => tracing::debug!(policy = alias, keys = set.len(), "key set warmed"),
            Err(err) => tracing::warn!(
                policy = alias,
                error = %err,
                "key set warm-up failed; will retry on first request"
            ),
        }
        Ok(authenticator)
    }

    pub fn with_scope_strategy(mut self, strategy: Arc<dyn ScopeStrategy>) -> Self {
        self.scope_strategy = Some(strategy);
        self
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn config(&self) -> &AuthenticationConfig {
        &self.config
    }

    pub fn key_store(&self) -> &KeyStore {
        &self.key_store
    }

    /// `Ok(false)` means the token was rejected; `Err` means the check could
    /// not be carried out.
    pub async fn authenticate(
        &self,
        token: &str,
        required_scopes: &[&str],
    ) -> Result<bool, AuthError> {
        match self.verify(token, required_scopes).await? {
            Verdict::Valid(_) => Ok(true),
            Verdict::Rejected(rejection) => {
                tracing::debug!(
                    policy = %self.alias,
                    code = rejection.code(),
                    reason = %rejection,
                    "token rejected"
                );
                Ok(false)
            }
        }
    }

    pub async fn verify(
        &self,
        token: &str,
        required_scopes: &[&str],
    ) -> Result<Verdict, AuthError> {
        let header = match decode_header(token) {
            Ok(header) => header,
            Err(err) => {
                return Ok(Verdict::Rejected(Rejection::TokenMalformed(err.to_string())));
            }
        };

        if !self.algorithms.is_empty() && !self.algorithms.contains(&header.alg) {
            return Ok(Verdict::Rejected(Rejection::AlgorithmNotAllowed(format!(
                "{:?}",
                header.alg
            ))));
        }

        let key_set = self.key_store.key_set().await?;
        let validation = self.validation(header.alg);

        let claims = match self.decode_with(&key_set, &header, token, &validation).await? {
            Ok(claims) => claims,
            Err(rejection) => return Ok(Verdict::Rejected(rejection)),
        };

        if let Some(iat) = claims.get("iat").and_then(Value::as_f64)
            && iat > now_secs().saturating_add(self.config.clock_skew_secs) as f64
        {
            return Ok(Verdict::Rejected(Rejection::TokenNotYetValid));
        }

        let scopes = token_scopes(&claims);
        if let Some(rejection) = self.check_scopes(&scopes, required_scopes) {
            return Ok(Verdict::Rejected(rejection));
        }

        Ok(Verdict::Valid(VerifiedToken { claims, scopes }))
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.config.clock_skew_secs;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        if !self.config.trusted_issuers.is_empty() {
            validation.set_issuer(&self.config.trusted_issuers);
        }
        if self.config.target_audience.is_empty() {
            validation.validate_aud = false;
        } else {
            validation.set_audience(&self.config.target_audience);
        }
        validation
    }

    async fn decode_with(
        &self,
        key_set: &Arc<KeySet>,
        header: &Header,
        token: &str,
        validation: &Validation,
    ) -> Result<Result<Value, Rejection>, AuthError> {
        let Some(kid) = header.kid.as_deref() else {
            return Ok(decode_any(key_set, token, validation));
        };

        if let Some(entry) = key_set.find(kid) {
            return Ok(decode_one(&entry.key, token, validation));
        }

        // A rotated signing key shows up as a kid miss. Refresh early, but not
        // on every request carrying a bogus kid.
        if key_set.age() < MIN_KID_MISS_REFRESH_INTERVAL {
            return Ok(Err(Rejection::UnknownKey(kid.to_string())));
        }

        let refreshed = self.key_store.refresh().await?;
        match refreshed.find(kid) {
            Some(entry) => Ok(decode_one(&entry.key, token, validation)),
            None => Ok(Err(Rejection::UnknownKey(kid.to_string()))),
        }
    }

    fn check_scopes(&self, granted: &[String], required_scopes: &[&str]) -> Option<Rejection> {
        let required = self
            .config
            .required_scopes
            .iter()
            .map(String::as_str)
            .chain(required_scopes.iter().copied())
            .collect::<Vec<_>>();

        if required.is_empty() {
            return None;
        }

        let Some(strategy) = self.scope_strategy.as_ref() else {
            return Some(Rejection::ScopeStrategyMissing);
        };

        required
            .into_iter()
            .find(|scope| !strategy.grants(granted, scope))
            .map(|scope| Rejection::ScopeMissing(scope.to_string()))
    }
}

impl std::fmt::Debug for JwtAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuthenticator")
            .field("alias", &self.alias)
            .field("algorithms", &self.algorithms)
            .field("scope_strategy", &self.scope_strategy.is_some())
            .field("key_store", &self.key_store)
            .finish()
    }
}

fn decode_one(key: &DecodingKey, token: &str, validation: &Validation) -> Result<Value, Rejection> {
    decode::<Value>(token, key, validation)
        .map(|data| data.claims)
        .map_err(Rejection::from)
}

fn decode_any(key_set: &KeySet, token: &str, validation: &Validation) -> Result<Value, Rejection> {
    for entry in key_set.keys() {
        match decode::<Value>(token, &entry.key, validation) {
            Ok(data) => return Ok(data.claims),
            Err(err) if is_key_mismatch(err.kind()) => continue,
            Err(err) => return Err(Rejection::from(err)),
        }
    }
    Err(Rejection::SignatureInvalid)
}

fn is_key_mismatch(kind: &ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
    )
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
