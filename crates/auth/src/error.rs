use jsonwebtoken::errors::ErrorKind;
use thiserror::Error;

/// Expected validation failures. These deny the request; they never indicate
/// that the system itself is degraded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("token is malformed: {0}")]
    TokenMalformed(String),

    #[error("algorithm {0} is not allowed")]
    AlgorithmNotAllowed(String),

    #[error("no verification key found for kid `{0}`")]
    UnknownKey(String),

    #[error("token signature is invalid")]
    SignatureInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("token not yet valid")]
    TokenNotYetValid,

    #[error("token issuer is not trusted")]
    IssuerNotTrusted,

    #[error("token audience does not match")]
    AudienceMismatch,

    #[error("required scope `{0}` is not granted")]
    ScopeMissing(String),

    #[error("scope validation requested but no scope strategy is configured")]
    ScopeStrategyMissing,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::TokenMalformed(_) => "ERR_TOKEN_MALFORMED",
            Rejection::AlgorithmNotAllowed(_) => "ERR_ALGORITHM_NOT_ALLOWED",
            Rejection::UnknownKey(_) => "ERR_UNKNOWN_KEY",
            Rejection::SignatureInvalid => "ERR_SIGNATURE_INVALID",
            Rejection::TokenExpired => "ERR_TOKEN_EXPIRED",
            Rejection::TokenNotYetValid => "ERR_TOKEN_NOT_YET_VALID",
            Rejection::IssuerNotTrusted => "ERR_ISSUER_NOT_TRUSTED",
            Rejection::AudienceMismatch => "ERR_AUDIENCE_MISMATCH",
            Rejection::ScopeMissing(_) => "ERR_SCOPE_MISSING",
            Rejection::ScopeStrategyMissing => "ERR_SCOPE_STRATEGY_MISSING",
        }
    }
}

impl From<jsonwebtoken::errors::Error> for Rejection {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidSignature => Rejection::SignatureInvalid,
            ErrorKind::ExpiredSignature => Rejection::TokenExpired,
            ErrorKind::ImmatureSignature => Rejection::TokenNotYetValid,
            ErrorKind::InvalidIssuer => Rejection::IssuerNotTrusted,
            ErrorKind::InvalidAudience => Rejection::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => Rejection::IssuerNotTrusted,
            ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => Rejection::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) => {
                Rejection::TokenMalformed(format!("missing required claim `{}`", claim))
            }
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidKeyFormat => {
                Rejection::SignatureInvalid
            }
            _ => Rejection::TokenMalformed(err.to_string()),
        }
    }
}

/// Operational failures. Callers decide whether to deny or report an outage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid authentication config: {0}")]
    InvalidConfig(String),

    #[error("failed to fetch key set from {url}: {reason}")]
    KeySetFetch { url: String, reason: String },

    #[error("key set from {url} is not a valid JWKS document: {reason}")]
    KeySetParse { url: String, reason: String },

    #[error("no key set is available")]
    KeyUnavailable,

    #[error("key set refresh was aborted")]
    RefreshAborted,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::InvalidConfig(_) => "ERR_INVALID_CONFIG",
            AuthError::KeySetFetch { .. } | AuthError::KeySetParse { .. } => "ERR_KEYSET_UNAVAILABLE",
            AuthError::KeyUnavailable => "ERR_KEY_UNAVAILABLE",
            AuthError::RefreshAborted => "ERR_KEYSET_UNAVAILABLE",
        }
    }
}
