use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use gatehouse_auth::{AuthError, Rejection, Verdict};
use gatehouse_contracts::{InvalidTarget, MapperOutput, Outcome, RequestTarget};
use gatehouse_policy::{
    BodyPlan, EngineError, Evaluation, PolicyEngine, QueryBody, QueryTranslator, RefPreprocessor,
    StoreQuery, Translation,
};
use serde_json::Value;
use thiserror::Error;
use tracing::Instrument;

use crate::datastore::DatastoreError;
use crate::mapper::MapperError;
use crate::reload::{ConfigHandle, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Authenticated,
    Routed,
    PolicyEvaluated,
    Preprocessed,
    Translated,
    Executed,
    Responded,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Authenticated => "authenticated",
            Stage::Routed => "routed",
            Stage::PolicyEvaluated => "policy_evaluated",
            Stage::Preprocessed => "preprocessed",
            Stage::Translated => "translated",
            Stage::Executed => "executed",
            Stage::Responded => "responded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidInput(#[from] InvalidTarget),

    #[error("bearer token required")]
    MissingToken,

    #[error("token rejected: {0}")]
    Unauthenticated(Rejection),

    #[error("authentication unavailable: {0}")]
    AuthUnavailable(AuthError),

    #[error(transparent)]
    Route(#[from] MapperError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Datastore(#[from] DatastoreError),

    #[error("request exceeded the {timeout_ms}ms deadline")]
    Timeout { timeout_ms: u64 },
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidInput(_) => "ERR_INVALID_INPUT",
            PipelineError::MissingToken => "ERR_TOKEN_MISSING",
            PipelineError::Unauthenticated(rejection) => rejection.code(),
            PipelineError::AuthUnavailable(err) => err.code(),
            PipelineError::Route(err) => err.code(),
            PipelineError::Engine(err) => err.code(),
            PipelineError::Datastore(err) => err.code(),
            PipelineError::Timeout { .. } => "ERR_REQUEST_TIMEOUT",
        }
    }

    pub fn outcome(&self) -> Outcome {
        match self {
            PipelineError::InvalidInput(_) => Outcome::Misconfigured,
            PipelineError::MissingToken | PipelineError::Unauthenticated(_) => {
                Outcome::Unauthenticated
            }
            PipelineError::AuthUnavailable(AuthError::InvalidConfig(_)) => Outcome::Misconfigured,
            PipelineError::AuthUnavailable(_) => Outcome::SourceUnavailable,
            PipelineError::Route(MapperError::RouteNotFound { .. }) => Outcome::NotFound,
            PipelineError::Route(_) => Outcome::Misconfigured,
            PipelineError::Engine(_) => Outcome::SourceUnavailable,
            PipelineError::Datastore(DatastoreError::Unknown(_)) => Outcome::Misconfigured,
            PipelineError::Datastore(_) => Outcome::SourceUnavailable,
            PipelineError::Timeout { .. } => Outcome::SourceUnavailable,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PipelineError::Engine(EngineError::Timeout)
            | PipelineError::Datastore(DatastoreError::Timeout { .. })
            | PipelineError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => match self.outcome() {
                Outcome::Unauthenticated => StatusCode::UNAUTHORIZED,
                Outcome::NotFound => StatusCode::NOT_FOUND,
                Outcome::SourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                Outcome::Allowed | Outcome::Denied | Outcome::Misconfigured => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    pub fn retryable(&self) -> bool {
        self.outcome() == Outcome::SourceUnavailable
    }
}

/// What the front end hands to the pipeline for one request.
#[derive(Debug, Clone)]
pub struct DecisionInput {
    pub request_id: String,
    pub token: Option<String>,
    pub input: Value,
}

/// Authenticate, route, evaluate, normalize, translate and execute, in that
/// order. The first failing stage ends the request.
#[derive(Clone)]
pub struct RequestPipeline {
    engine: Arc<dyn PolicyEngine>,
    config: ConfigHandle,
    preprocessor: RefPreprocessor,
    request_timeout: Duration,
}

impl RequestPipeline {
    pub fn new(engine: Arc<dyn PolicyEngine>, config: ConfigHandle, request_timeout: Duration) -> Self {
        Self {
            engine,
            config,
            preprocessor: RefPreprocessor::new(),
            request_timeout,
        }
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn PolicyEngine> {
        &self.engine
    }

    pub async fn decide(&self, request: DecisionInput) -> Result<bool, PipelineError> {
        let span = tracing::info_span!(
            "decision",
            request_id = %request.request_id,
            method = tracing::field::Empty,
            path = tracing::field::Empty,
            datastore = tracing::field::Empty,
            package = tracing::field::Empty,
            stage = Stage::Received.as_str(),
            outcome = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        );
        let started = Instant::now();
        let timeout = self.request_timeout;

        async move {
            let mut routed = None;
            let result = match tokio::time::timeout(
                timeout,
                self.run(&request.input, request.token.as_deref(), &mut routed),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }),
            };

            let outcome = match &result {
                Ok(true) => Outcome::Allowed,
                Ok(false) => Outcome::Denied,
                Err(err) => err.outcome(),
            };
            let elapsed = started.elapsed();
            let span = tracing::Span::current();
            span.record("latency_ms", elapsed.as_millis() as u64);
            span.record("outcome", outcome.as_str());
            enter(Stage::Responded);

            match &result {
                Ok(_) => tracing::info!("decision made"),
                Err(err) if err.retryable() => {
                    tracing::warn!(code = err.code(), error = %err, "decision failed")
                }
                Err(err) => tracing::info!(code = err.code(), error = %err, "decision refused"),
            }

            let package = routed.as_ref().map(|o: &MapperOutput| o.package.as_str());
            crate::metrics::observe_decision(package.unwrap_or_default(), outcome.as_str(), elapsed);
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        input: &Value,
        token: Option<&str>,
        routed: &mut Option<MapperOutput>,
    ) -> Result<bool, PipelineError> {
        let snapshot = self.config.current();
        let target = RequestTarget::from_input(input)?;
        let span = tracing::Span::current();
        span.record("method", target.method.as_str());
        span.record("path", target.path.as_str());

        authenticate(&snapshot, token).await?;
        enter(Stage::Authenticated);

        let output = snapshot.mapper.map(&target)?;
        span.record("datastore", output.datastore.as_str());
        span.record("package", output.package.as_str());
        enter(Stage::Routed);
        let output = routed.insert(output);

        let unknowns = snapshot.translator.unknowns(&output.datastore);
        let evaluation = self
            .engine
            .evaluate(&output.package, input, &unknowns)
            .await?;
        enter(Stage::PolicyEvaluated);

        let bodies = match evaluation {
            Evaluation::Decision(allowed) => return Ok(allowed),
            Evaluation::Partial(bodies) => bodies,
        };

        let bodies = self.preprocess(bodies);
        enter(Stage::Preprocessed);

        let plans = plan(&snapshot.translator, &output.datastore, bodies);
        let translation = QueryTranslator::assemble(plans);
        enter(Stage::Translated);

        let allowed = match translation {
            Translation::Allow => true,
            Translation::Deny => false,
            Translation::Query(queries) => execute(&snapshot, &queries).await?,
        };
        enter(Stage::Executed);
        Ok(allowed)
    }

    fn preprocess(&self, bodies: Vec<QueryBody>) -> Vec<QueryBody> {
        let mut out = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.into_iter().enumerate() {
            match self.preprocessor.process_body(body) {
                Ok(body) => out.push(body),
                Err(err) => {
                    tracing::warn!(body = index, code = err.code(), error = %err, "query body dropped");
                    crate::metrics::inc_dropped_body(err.code());
                }
            }
        }
        out
    }
}

fn enter(stage: Stage) {
    tracing::Span::current().record("stage", stage.as_str());
}

async fn authenticate(snapshot: &Snapshot, token: Option<&str>) -> Result<(), PipelineError> {
    let Some(authenticator) = snapshot.authenticator() else {
        return Ok(());
    };
    let token = token.ok_or(PipelineError::MissingToken)?;

    match authenticator
        .verify(token, &[])
        .await
        .map_err(PipelineError::AuthUnavailable)?
    {
        Verdict::Valid(_) => Ok(()),
        Verdict::Rejected(rejection) => Err(PipelineError::Unauthenticated(rejection)),
    }
}

fn plan(translator: &QueryTranslator, datastore: &str, bodies: Vec<QueryBody>) -> Vec<BodyPlan> {
    let mut plans = Vec::with_capacity(bodies.len());
    for (index, body) in bodies.iter().enumerate() {
        match translator.plan_body(datastore, body) {
            Ok(plan) => plans.push(plan),
            Err(err) => {
                tracing::warn!(body = index, code = err.code(), error = %err, "query body dropped");
                crate::metrics::inc_dropped_body(err.code());
            }
        }
    }
    plans
}

async fn execute(snapshot: &Snapshot, queries: &[StoreQuery]) -> Result<bool, PipelineError> {
    for query in queries {
        let store = snapshot
            .datastores
            .get(&query.datastore)
            .ok_or_else(|| DatastoreError::Unknown(query.datastore.clone()))?;
        if store.exists(query).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gatehouse_policy::{Expr, SqlValue, Term, parse_ref};
    use serde_json::json;

    use crate::app_config::AppConfig;
    use crate::datastore::{Datastore, DatastoreMap};

    const API: &str = r#"
mappings:
  - prefix: /api
    datastore: db1
    mappings:
      - path: /pets/{id}
        package: pets
        methods: [GET]
"#;

    const API_WITH_AUTH: &str = r#"
authentication:
  default:
    allowed_algorithms: ["HS256"]
    jwks_urls: ["file:///nonexistent/gatehouse/jwks.json"]
mappings:
  - prefix: /api
    datastore: db1
    mappings:
      - path: /pets/{id}
        package: pets
        methods: [GET]
"#;

    const DATASTORES: &str = r#"
datastores:
  db1:
    type: postgres
    connection:
      url: postgres://gatehouse@localhost/petstore
entity_schemas:
  db1:
    petstore:
      entities:
        - name: pets
"#;

    struct StaticEngine {
        evaluation: Evaluation,
        delay: Duration,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl StaticEngine {
        fn new(evaluation: Evaluation) -> Arc<Self> {
            Arc::new(Self {
                evaluation,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PolicyEngine for StaticEngine {
        async fn evaluate(
            &self,
            package: &str,
            _input: &Value,
            unknowns: &[String],
        ) -> Result<Evaluation, EngineError> {
            self.calls
                .lock()
                .unwrap()
                .push((package.to_string(), unknowns.to_vec()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.evaluation.clone())
        }
    }

    struct RecordingStore {
        answer: bool,
        queries: Mutex<Vec<StoreQuery>>,
    }

    #[async_trait]
    impl Datastore for RecordingStore {
        async fn exists(&self, query: &StoreQuery) -> Result<bool, DatastoreError> {
            self.queries.lock().unwrap().push(query.clone());
            Ok(self.answer)
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    async fn pipeline(
        api: &str,
        auth_policy: Option<&str>,
        engine: Arc<StaticEngine>,
        answer: bool,
    ) -> (RequestPipeline, Arc<RecordingStore>) {
        let store = Arc::new(RecordingStore {
            answer,
            queries: Mutex::new(Vec::new()),
        });
        let mut datastores: DatastoreMap = DatastoreMap::new();
        datastores.insert("db1".to_string(), store.clone());

        let app = AppConfig::from_yaml(api, DATASTORES).expect("config parses");
        let snapshot = Snapshot::build(&app, auth_policy, datastores)
            .await
            .expect("snapshot builds");
        let pipeline = RequestPipeline::new(
            engine,
            ConfigHandle::new(snapshot),
            Duration::from_secs(5),
        );
        (pipeline, store)
    }

    fn request(method: &str, path: &str) -> DecisionInput {
        DecisionInput {
            request_id: "test".to_string(),
            token: None,
            input: json!({"method": method, "path": path, "user": "alice"}),
        }
    }

    fn kind_is(kind: &str) -> QueryBody {
        vec![Expr::call(
            0,
            "eq",
            vec![parse_ref("data.pets[$0].kind"), Term::string(kind)],
        )]
    }

    #[tokio::test]
    async fn boolean_decision_skips_datastores() {
        let engine = StaticEngine::new(Evaluation::Decision(true));
        let (pipeline, store) = pipeline(API, None, engine.clone(), false).await;

        let allowed = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .expect("decides");

        assert!(allowed);
        assert!(store.queries.lock().unwrap().is_empty());
        let calls = engine.calls.lock().unwrap();
        assert_eq!(calls[0].0, "pets");
        assert_eq!(calls[0].1, vec!["data.pets".to_string()]);
    }

    #[tokio::test]
    async fn partial_result_is_executed_against_routed_datastore() {
        let engine = StaticEngine::new(Evaluation::Partial(vec![kind_is("dog")]));
        let (pipeline, store) = pipeline(API, None, engine, true).await;

        let allowed = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .expect("decides");

        assert!(allowed);
        let queries = store.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].datastore, "db1");
        assert_eq!(queries[0].binds, vec![SqlValue::Text("dog".to_string())]);
    }

    #[tokio::test]
    async fn datastore_answering_false_denies() {
        let engine = StaticEngine::new(Evaluation::Partial(vec![kind_is("dog")]));
        let (pipeline, _) = pipeline(API, None, engine, false).await;

        let allowed = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .expect("decides");
        assert!(!allowed);
    }

    #[tokio::test]
    async fn failing_body_is_dropped_and_others_still_count() {
        let self_link = vec![
            Expr::term(0, parse_ref("data.pets[$0].name")),
            Expr::term(1, parse_ref("data.pets[$1].name")),
        ];
        let engine = StaticEngine::new(Evaluation::Partial(vec![self_link, kind_is("cat")]));
        let (pipeline, store) = pipeline(API, None, engine, true).await;

        let allowed = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .expect("decides");

        assert!(allowed);
        let queries = store.queries.lock().unwrap();
        assert_eq!(queries[0].binds, vec![SqlValue::Text("cat".to_string())]);
    }

    #[tokio::test]
    async fn every_body_dropped_means_deny() {
        let unknown_entity = vec![Expr::call(
            0,
            "eq",
            vec![parse_ref("data.owners[$0].id"), Term::string("1")],
        )];
        let engine = StaticEngine::new(Evaluation::Partial(vec![unknown_entity]));
        let (pipeline, store) = pipeline(API, None, engine, true).await;

        let allowed = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .expect("decides");

        assert!(!allowed);
        assert!(store.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn body_that_can_never_hold_denies_without_querying() {
        let never = vec![
            Expr::term(0, Term::Boolean(false)),
            Expr::call(1, "eq", vec![Term::string("admin"), Term::string("guest")]),
        ];
        let literal_row = vec![Expr::call(
            0,
            "eq",
            vec![
                Term::Ref(vec![
                    Term::var("data"),
                    Term::string("pets"),
                    Term::Number(0.into()),
                    Term::string("kind"),
                ]),
                Term::string("dog"),
            ],
        )];
        for bodies in [vec![never], vec![literal_row]] {
            let engine = StaticEngine::new(Evaluation::Partial(bodies));
            let (pipeline, store) = pipeline(API, None, engine, true).await;

            let allowed = pipeline
                .decide(request("GET", "/api/pets/1"))
                .await
                .expect("decides");

            assert!(!allowed);
            assert!(store.queries.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn unrouted_request_is_not_found() {
        let engine = StaticEngine::new(Evaluation::Decision(true));
        let (pipeline, _) = pipeline(API, None, engine.clone(), true).await;

        let err = pipeline
            .decide(request("POST", "/api/pets/1"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Route(MapperError::RouteNotFound { .. })));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.outcome(), Outcome::NotFound);
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_method_is_a_bad_request() {
        let engine = StaticEngine::new(Evaluation::Decision(true));
        let (pipeline, _) = pipeline(API, None, engine, true).await;

        let err = pipeline
            .decide(DecisionInput {
                request_id: "test".to_string(),
                token: None,
                input: json!({"path": "/api/pets/1"}),
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ERR_INVALID_INPUT");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_token_is_rejected_before_routing() {
        let engine = StaticEngine::new(Evaluation::Decision(true));
        let (pipeline, _) = pipeline(API_WITH_AUTH, Some("default"), engine.clone(), true).await;

        let err = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::MissingToken);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_token_is_unauthenticated() {
        let engine = StaticEngine::new(Evaluation::Decision(true));
        let (pipeline, _) = pipeline(API_WITH_AUTH, Some("default"), engine, true).await;

        let mut req = request("GET", "/api/pets/1");
        req.token = Some("not-a-jwt".to_string());
        let err = pipeline.decide(req).await.unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Unauthenticated(Rejection::TokenMalformed(_))
        ));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn slow_engine_hits_request_deadline() {
        let engine = Arc::new(StaticEngine {
            evaluation: Evaluation::Decision(true),
            delay: Duration::from_millis(200),
            calls: Mutex::new(Vec::new()),
        });
        let (pipeline, _) = pipeline(API, None, engine, true).await;
        let pipeline = RequestPipeline {
            request_timeout: Duration::from_millis(20),
            ..pipeline
        };

        let err = pipeline
            .decide(request("GET", "/api/pets/1"))
            .await
            .unwrap_err();

        assert_eq!(err, PipelineError::Timeout { timeout_ms: 20 });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(err.retryable());
    }
}
