use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scope::ScopeStrategyKind;

pub const DEFAULT_JWKS_TTL_SECS: u64 = 30 * 60;
pub const DEFAULT_JWKS_MAX_WAIT_MS: u64 = 100;

/// One named authentication policy. Immutable once an authenticator has been
/// configured from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub trusted_issuers: Vec<String>,
    #[serde(default)]
    pub target_audience: Vec<String>,
    #[serde(default)]
    pub allowed_algorithms: Vec<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default)]
    pub scope_strategy: Option<ScopeStrategyKind>,
    #[serde(default)]
    pub jwks_urls: Vec<String>,
    #[serde(default = "default_jwks_ttl_secs")]
    pub jwks_ttl_secs: u64,
    #[serde(default = "default_jwks_max_wait_ms")]
    pub jwks_max_wait_ms: u64,
    #[serde(default)]
    pub clock_skew_secs: u64,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            trusted_issuers: Vec::new(),
            target_audience: Vec::new(),
            allowed_algorithms: Vec::new(),
            required_scopes: Vec::new(),
            scope_strategy: None,
            jwks_urls: Vec::new(),
            jwks_ttl_secs: DEFAULT_JWKS_TTL_SECS,
            jwks_max_wait_ms: DEFAULT_JWKS_MAX_WAIT_MS,
            clock_skew_secs: 0,
        }
    }
}

impl AuthenticationConfig {
    pub fn jwks_ttl(&self) -> Duration {
        Duration::from_secs(self.jwks_ttl_secs)
    }

    pub fn jwks_max_wait(&self) -> Duration {
        Duration::from_millis(self.jwks_max_wait_ms)
    }
}

fn default_jwks_ttl_secs() -> u64 {
    DEFAULT_JWKS_TTL_SECS
}

fn default_jwks_max_wait_ms() -> u64 {
    DEFAULT_JWKS_MAX_WAIT_MS
}
