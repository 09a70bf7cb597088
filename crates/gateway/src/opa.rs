use std::time::Duration;

use async_trait::async_trait;
use gatehouse_policy::{EngineError, Evaluation, PolicyEngine, QueryBody};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct CompileRequest<'a> {
    query: String,
    input: &'a Value,
    unknowns: &'a [String],
}

#[derive(Deserialize)]
struct CompileResponse {
    #[serde(default)]
    result: CompileResult,
}

#[derive(Default, Deserialize)]
struct CompileResult {
    #[serde(default)]
    queries: Option<Vec<QueryBody>>,
}

/// Policy engine backed by OPA's compile (partial evaluation) API.
#[derive(Clone)]
pub struct OpaClient {
    base_url: String,
    http: reqwest::Client,
}

impl OpaClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EngineError::Unavailable(err.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn compile_url(&self) -> String {
        format!("{}/v1/compile", self.base_url)
    }

    fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }
}

impl std::fmt::Debug for OpaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpaClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

fn map_reqwest_error(err: reqwest::Error) -> EngineError {
    if err.is_timeout() {
        EngineError::Timeout
    } else {
        EngineError::Unavailable(err.to_string())
    }
}

/// `data.<package>.allow == true`, with `/` separators accepted in the
/// package name.
pub fn allow_query(package: &str) -> String {
    let package = package.trim_matches(|c| c == '.' || c == '/').replace('/', ".");
    format!("data.{}.allow == true", package)
}

pub fn evaluation_from_queries(queries: Option<Vec<QueryBody>>) -> Evaluation {
    match queries {
        None => Evaluation::Decision(false),
        Some(bodies) if bodies.is_empty() => Evaluation::Decision(false),
        Some(bodies) if bodies.iter().any(|body| body.is_empty()) => Evaluation::Decision(true),
        Some(bodies) => Evaluation::Partial(bodies),
    }
}

#[async_trait]
impl PolicyEngine for OpaClient {
    async fn evaluate(
        &self,
        package: &str,
        input: &Value,
        unknowns: &[String],
    ) -> Result<Evaluation, EngineError> {
        let request = CompileRequest {
            query: allow_query(package),
            input,
            unknowns,
        };

        let resp = self
            .http
            .post(self.compile_url())
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !resp.status().is_success() {
            return Err(EngineError::BadStatus {
                status: resp.status().as_u16(),
            });
        }

        let decoded = resp
            .json::<CompileResponse>()
            .await
            .map_err(|err| EngineError::InvalidResponse(err.to_string()))?;

        Ok(evaluation_from_queries(decoded.result.queries))
    }

    async fn ready(&self) -> bool {
        match self.http.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                tracing::debug!(error = %err, "policy engine health check failed");
                false
            }
        }
    }
}
