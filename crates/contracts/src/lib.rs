use http::Uri;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Allowed,
    Denied,
    Unauthenticated,
    NotFound,
    Misconfigured,
    SourceUnavailable,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allowed => "ALLOWED",
            Outcome::Denied => "DENIED",
            Outcome::Unauthenticated => "UNAUTHENTICATED",
            Outcome::NotFound => "NOT_FOUND",
            Outcome::Misconfigured => "MISCONFIGURED",
            Outcome::SourceUnavailable => "SOURCE_UNAVAILABLE",
        }
    }
}

/// Routing decision for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperOutput {
    pub datastore: String,
    pub package: String,
}

/// Body accepted by the data endpoint. The whole `input` document is handed
/// to the policy engine; `method` and `path` inside it drive routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionRequest {
    pub input: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub outcome: Outcome,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidTarget {
    #[error("input.method must be a non-empty string")]
    MissingMethod,
    #[error("input.path must be a non-empty string")]
    MissingPath,
    #[error("input.path is not a valid request path: {0}")]
    MalformedPath(String),
}

/// Method, path and raw query string of the request being authorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
}

impl RequestTarget {
    pub fn parse(method: &str, raw_path: &str) -> Result<Self, InvalidTarget> {
        let method = method.trim();
        if method.is_empty() {
            return Err(InvalidTarget::MissingMethod);
        }

        let raw_path = raw_path.trim();
        if raw_path.is_empty() {
            return Err(InvalidTarget::MissingPath);
        }

        let uri = raw_path
            .parse::<Uri>()
            .map_err(|_| InvalidTarget::MalformedPath(raw_path.to_string()))?;
        let path = uri.path();
        if !path.starts_with('/') {
            return Err(InvalidTarget::MalformedPath(raw_path.to_string()));
        }

        Ok(Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            query: uri
                .query()
                .filter(|q| !q.is_empty())
                .map(|q| q.to_string()),
        })
    }

    pub fn from_input(input: &serde_json::Value) -> Result<Self, InvalidTarget> {
        let method = input
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or(InvalidTarget::MissingMethod)?;
        let path = input
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or(InvalidTarget::MissingPath)?;
        Self::parse(method, path)
    }

    pub fn query_param_names(&self) -> Vec<&str> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };

        query
            .split('&')
            .filter_map(|pair| pair.split('=').next())
            .filter(|name| !name.is_empty())
            .collect()
    }
}
