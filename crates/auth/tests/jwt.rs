use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use gatehouse_auth::{
    AuthError, AuthenticationConfig, JwtAuthenticator, Rejection, SCOPE_CLAIMS, ScopeStrategyKind,
    Verdict,
};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const SECRET: &[u8] = b"gatehouse-test-secret-0123456789";
const SECOND_SECRET: &[u8] = b"second-secret";
const ISSUER: &str = "https://issuer.example";
const AUDIENCE: &str = "gatehouse";

fn jwks() -> Value {
    json!({
        "keys": [
            {"kty": "oct", "kid": "hs-key", "alg": "HS256", "k": "Z2F0ZWhvdXNlLXRlc3Qtc2VjcmV0LTAxMjM0NTY3ODk"},
            {"kty": "oct", "kid": "second", "alg": "HS256", "k": "c2Vjb25kLXNlY3JldA"}
        ]
    })
}

fn jwks_file() -> (tempfile::NamedTempFile, String) {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(jwks().to_string().as_bytes())
        .expect("write jwks");
    let url = reqwest::Url::from_file_path(file.path())
        .expect("file url")
        .to_string();
    (file, url)
}

fn config(jwks_url: &str) -> AuthenticationConfig {
    AuthenticationConfig {
        trusted_issuers: vec![ISSUER.to_string()],
        target_audience: vec![AUDIENCE.to_string()],
        allowed_algorithms: vec!["HS256".to_string()],
        jwks_urls: vec![jwks_url.to_string()],
        ..AuthenticationConfig::default()
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_secs()
}

fn claims() -> Value {
    let now = now();
    json!({
        "iss": ISSUER,
        "aud": AUDIENCE,
        "sub": "alice",
        "iat": now,
        "exp": now + 3600,
    })
}

fn sign_with(kid: Option<&str>, secret: &[u8], claims: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = kid.map(str::to_string);
    encode(&header, claims, &EncodingKey::from_secret(secret)).expect("token encodes")
}

fn sign(claims: &Value) -> String {
    sign_with(Some("hs-key"), SECRET, claims)
}

async fn rejection(auth: &JwtAuthenticator, token: &str, scopes: &[&str]) -> Rejection {
    match auth.verify(token, scopes).await.expect("no operational error") {
        Verdict::Rejected(rejection) => rejection,
        Verdict::Valid(_) => panic!("token should have been rejected"),
    }
}

#[tokio::test]
async fn valid_token_authenticates() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    assert!(auth.authenticate(&sign(&claims()), &[]).await.expect("ok"));
    assert_eq!(auth.key_store().fetch_count(), 1);
}

#[tokio::test]
async fn scope_string_is_accepted_under_every_scope_claim() {
    let (_file, url) = jwks_file();
    let mut cfg = config(&url);
    cfg.scope_strategy = Some(ScopeStrategyKind::Exact);
    let auth = JwtAuthenticator::configure(cfg, "default")
        .await
        .expect("configure");

    for claim in SCOPE_CLAIMS {
        let mut claims = claims();
        claims[claim] = json!("pets.read pets.write");
        let token = sign(&claims);

        assert!(
            auth.authenticate(&token, &["pets.read"]).await.expect("ok"),
            "scope under `{}` should be accepted",
            claim
        );
    }
}

#[tokio::test]
async fn scope_array_and_policy_scopes_are_combined() {
    let (_file, url) = jwks_file();
    let mut cfg = config(&url);
    cfg.scope_strategy = Some(ScopeStrategyKind::Hierarchic);
    cfg.required_scopes = vec!["pets.read".to_string()];
    let auth = JwtAuthenticator::configure(cfg, "default")
        .await
        .expect("configure");

    let mut claims = claims();
    claims["scp"] = json!(["pets"]);
    assert!(auth
        .authenticate(&sign(&claims), &["pets.write"])
        .await
        .expect("ok"));

    claims["scp"] = json!(["pets.read"]);
    assert_eq!(
        rejection(&auth, &sign(&claims), &["pets.write"]).await,
        Rejection::ScopeMissing("pets.write".to_string())
    );
}

#[tokio::test]
async fn required_scopes_without_strategy_are_rejected() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let mut claims = claims();
    claims["scope"] = json!("pets.read");
    let token = sign(&claims);

    assert!(!auth.authenticate(&token, &["pets.read"]).await.expect("ok"));
    assert_eq!(
        rejection(&auth, &token, &["pets.read"]).await,
        Rejection::ScopeStrategyMissing
    );
}

#[tokio::test]
async fn expired_token_with_valid_signature_is_denied() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let mut claims = claims();
    claims["iat"] = json!(now() - 7200);
    claims["exp"] = json!(now() - 3600);
    let token = sign(&claims);

    assert!(!auth.authenticate(&token, &[]).await.expect("ok"));
    assert_eq!(rejection(&auth, &token, &[]).await, Rejection::TokenExpired);
}

#[tokio::test]
async fn future_nbf_and_iat_are_not_yet_valid() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let mut nbf = claims();
    nbf["nbf"] = json!(now() + 3600);
    assert_eq!(
        rejection(&auth, &sign(&nbf), &[]).await,
        Rejection::TokenNotYetValid
    );

    let mut iat = claims();
    iat["iat"] = json!(now() + 3600);
    iat["exp"] = json!(now() + 7200);
    assert_eq!(
        rejection(&auth, &sign(&iat), &[]).await,
        Rejection::TokenNotYetValid
    );
}

#[tokio::test]
async fn fractional_iat_is_checked_like_an_integer_one() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let mut future = claims();
    future["iat"] = json!(now() as f64 + 3600.5);
    future["exp"] = json!(now() + 7200);
    assert_eq!(
        rejection(&auth, &sign(&future), &[]).await,
        Rejection::TokenNotYetValid
    );

    let mut past = claims();
    past["iat"] = json!(now() as f64 - 0.25);
    assert!(auth.authenticate(&sign(&past), &[]).await.expect("ok"));
}

#[tokio::test]
async fn issuer_and_audience_must_match() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let mut issuer = claims();
    issuer["iss"] = json!("https://evil.example");
    assert_eq!(
        rejection(&auth, &sign(&issuer), &[]).await,
        Rejection::IssuerNotTrusted
    );

    let mut audience = claims();
    audience["aud"] = json!(["someone-else"]);
    assert_eq!(
        rejection(&auth, &sign(&audience), &[]).await,
        Rejection::AudienceMismatch
    );
}

#[tokio::test]
async fn malformed_token_and_disallowed_algorithm_are_rejected() {
    let (_file, url) = jwks_file();
    let mut cfg = config(&url);
    let auth = JwtAuthenticator::configure(cfg.clone(), "default")
        .await
        .expect("configure");

    assert!(!auth.authenticate("invalid", &[]).await.expect("ok"));
    assert!(matches!(
        rejection(&auth, "invalid", &[]).await,
        Rejection::TokenMalformed(_)
    ));

    cfg.allowed_algorithms = vec!["RS256".to_string()];
    let rs_only = JwtAuthenticator::configure(cfg, "rs-only")
        .await
        .expect("configure");
    assert_eq!(
        rejection(&rs_only, &sign(&claims()), &[]).await,
        Rejection::AlgorithmNotAllowed("HS256".to_string())
    );
}

#[tokio::test]
async fn signature_and_kid_are_checked() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let forged = sign_with(Some("hs-key"), b"not-the-right-secret", &claims());
    assert_eq!(
        rejection(&auth, &forged, &[]).await,
        Rejection::SignatureInvalid
    );

    let rotated = sign_with(Some("rotated"), SECRET, &claims());
    assert_eq!(
        rejection(&auth, &rotated, &[]).await,
        Rejection::UnknownKey("rotated".to_string())
    );
    assert_eq!(auth.key_store().fetch_count(), 1);
}

#[tokio::test]
async fn token_without_kid_tries_every_key() {
    let (_file, url) = jwks_file();
    let auth = JwtAuthenticator::configure(config(&url), "default")
        .await
        .expect("configure");

    let token = sign_with(None, SECOND_SECRET, &claims());
    assert!(auth.authenticate(&token, &[]).await.expect("ok"));
}

#[tokio::test]
async fn unreachable_key_source_is_an_operational_error() {
    let auth = JwtAuthenticator::configure(
        config("file:///nonexistent/gatehouse/jwks.json"),
        "default",
    )
    .await
    .expect("configure tolerates a failed warm-up");

    let err = auth.authenticate(&sign(&claims()), &[]).await.unwrap_err();
    assert!(matches!(err, AuthError::KeySetFetch { .. }));
}

#[test]
fn invalid_configs_fail_fast() {
    let mut cfg = config("https://keys.example/jwks.json");
    cfg.allowed_algorithms = vec!["HS999".to_string()];
    assert!(matches!(
        JwtAuthenticator::new(cfg, "default"),
        Err(AuthError::InvalidConfig(_))
    ));

    let mut cfg = config("https://keys.example/jwks.json");
    cfg.jwks_urls = vec!["ftp://keys.example/jwks.json".to_string()];
    assert!(matches!(
        JwtAuthenticator::new(cfg, "default"),
        Err(AuthError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn policy_without_key_sources_rejects_every_token() {
    let mut cfg = config("https://keys.example/jwks.json");
    cfg.jwks_urls.clear();
    let auth = JwtAuthenticator::configure(cfg, "keyless")
        .await
        .expect("an empty jwks list is a valid policy");

    assert_eq!(
        rejection(&auth, &sign(&claims()), &[]).await,
        Rejection::UnknownKey("hs-key".to_string())
    );
    assert_eq!(
        rejection(&auth, &sign_with(None, SECRET, &claims()), &[]).await,
        Rejection::SignatureInvalid
    );
}

async fn jwks_handler(State((hits, delay)): State<(Arc<AtomicUsize>, Duration)>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(delay).await;
    Json(jwks())
}

async fn spawn_jwks_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/jwks.json", get(jwks_handler))
        .with_state((hits.clone(), delay));

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}/jwks.json", addr), hits)
}

#[tokio::test]
async fn concurrent_authentication_on_stale_key_set_fetches_once() {
    let (url, hits) = spawn_jwks_server(Duration::from_millis(200)).await;
    let mut cfg = config(&url);
    cfg.jwks_ttl_secs = 0;
    cfg.jwks_max_wait_ms = 5_000;
    let auth = JwtAuthenticator::new(cfg, "default").expect("new");
    let token = sign(&claims());

    let calls = (0..16).map(|_| auth.authenticate(&token, &[]));
    let results = futures::future::join_all(calls).await;
    assert!(results.into_iter().all(|r| r.expect("ok")));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Every set is stale immediately, so a second wave refreshes exactly once more.
    let calls = (0..16).map(|_| auth.authenticate(&token, &[]));
    let results = futures::future::join_all(calls).await;
    assert!(results.into_iter().all(|r| r.expect("ok")));
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(auth.key_store().fetch_count(), 2);
}

#[tokio::test]
async fn slow_first_fetch_is_bounded_by_max_wait() {
    let (url, hits) = spawn_jwks_server(Duration::from_millis(300)).await;
    let mut cfg = config(&url);
    cfg.jwks_max_wait_ms = 20;
    let auth = JwtAuthenticator::new(cfg, "default").expect("new");
    let token = sign(&claims());

    let err = auth.authenticate(&token, &[]).await.unwrap_err();
    assert_eq!(err, AuthError::KeyUnavailable);

    // The fetch keeps running after the caller gave up and fills the cache.
    for _ in 0..50 {
        if auth.key_store().current().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(auth.authenticate(&token, &[]).await.expect("ok"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
