use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gatehouse_contracts::{DecisionRequest, DecisionResponse, ErrorResponse, Outcome};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};
use crate::opa::OpaClient;
use crate::pipeline::{DecisionInput, RequestPipeline};
use crate::reload::{ConfigHandle, Snapshot};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub pipeline: RequestPipeline,
}

impl AppState {
    /// Loads the configuration snapshot and wires the policy engine client.
    pub async fn load(config: GatewayConfig) -> Result<Self, StartupError> {
        let snapshot = Snapshot::load(&config).await?;
        let opa = OpaClient::new(&config.opa_url, config.opa_timeout()).map_err(|err| {
            StartupError::new(
                "ERR_POLICY_ENGINE_UNAVAILABLE",
                format!("failed to initialize policy client: {}", err),
            )
        })?;

        let pipeline = RequestPipeline::new(
            Arc::new(opa),
            ConfigHandle::new(snapshot),
            config.request_timeout(),
        );
        Ok(Self {
            config: Arc::new(config),
            pipeline,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let decide_path = format!("{}/data", state.config.path_prefix);
    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(decide_path.as_str(), post(decide));
    if state.config.metrics_enabled {
        router = router.route("/metrics", get(metrics));
    }
    router.with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<String, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert(
        "policy_engine".to_string(),
        state.pipeline.engine().ready().await,
    );

    let snapshot = state.pipeline.config().current();
    for (alias, store) in &snapshot.datastores {
        checks.insert(format!("datastore:{}", alias), store.ping().await);
    }

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn decide(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<DecisionRequest>, JsonRejection>,
) -> Response {
    let request_id = extract_request_id(&headers);
    let response = decide_inner(&state, &headers, req, request_id.clone()).await;

    let mut response = match response {
        Ok(response) => response.into_response(),
        Err(err) => err.into_response(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn decide_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: Result<Json<DecisionRequest>, JsonRejection>,
    request_id: String,
) -> Result<(StatusCode, Json<DecisionResponse>), ApiError> {
    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
            Outcome::Misconfigured,
            false,
        )
    })?;
    if !req.input.is_object() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "input must be a JSON object",
            Outcome::Misconfigured,
            false,
        ));
    }

    let token = gatehouse_auth::bearer_token(headers).map_err(|rejection| {
        json_error(
            StatusCode::UNAUTHORIZED,
            rejection.code(),
            rejection.to_string(),
            Outcome::Unauthenticated,
            false,
        )
    })?;

    let decision = state
        .pipeline
        .decide(DecisionInput {
            request_id,
            token,
            input: req.input,
        })
        .await;

    match decision {
        Ok(true) => Ok((StatusCode::OK, Json(DecisionResponse { result: true }))),
        Ok(false) => Ok((StatusCode::FORBIDDEN, Json(DecisionResponse { result: false }))),
        Err(err) => Err(json_error(
            err.status(),
            err.code(),
            err.to_string(),
            err.outcome(),
            err.retryable(),
        )),
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    outcome: Outcome,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            outcome,
            retryable,
        }),
    )
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_sanitized_and_bounded() {
        assert_eq!(
            sanitize_request_id("abc-123_x.y<script>").as_deref(),
            Some("abc-123_x.yscript")
        );
        assert_eq!(sanitize_request_id("<>{}"), None);
        assert_eq!(sanitize_request_id(&"a".repeat(200)).map(|s| s.len()), Some(64));
    }

    #[test]
    fn missing_request_id_gets_a_ulid() {
        let id = extract_request_id(&HeaderMap::new());
        assert!(id.parse::<Ulid>().is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));
        assert_eq!(extract_request_id(&headers), "req-42");
    }
}
