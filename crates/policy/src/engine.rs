use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::ast::QueryBody;

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The engine reached a final answer without consulting any datastore.
    Decision(bool),
    /// Residual conditions on the unknowns; any one body holding allows.
    Partial(Vec<QueryBody>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("policy engine did not answer in time")]
    Timeout,

    #[error("policy engine is unreachable: {0}")]
    Unavailable(String),

    #[error("policy engine returned status {status}")]
    BadStatus { status: u16 },

    #[error("policy engine response is invalid: {0}")]
    InvalidResponse(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Timeout => "ERR_POLICY_ENGINE_TIMEOUT",
            EngineError::Unavailable(_) | EngineError::BadStatus { .. } => {
                "ERR_POLICY_ENGINE_UNAVAILABLE"
            }
            EngineError::InvalidResponse(_) => "ERR_POLICY_ENGINE_INVALID_RESPONSE",
        }
    }
}

/// Partial evaluator for policy packages.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluates `package` against `input`, treating every path in
    /// `unknowns` (e.g. `data.pets`) as data that is not available yet.
    async fn evaluate(
        &self,
        package: &str,
        input: &Value,
        unknowns: &[String],
    ) -> Result<Evaluation, EngineError>;

    async fn ready(&self) -> bool {
        true
    }
}
