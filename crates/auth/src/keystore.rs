use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use reqwest::Url;

use crate::error::AuthError;

const KEY_SET_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct KeyEntry {
    pub kid: Option<String>,
    pub key: DecodingKey,
}

/// Verification keys from every configured source, as of one fetch. Never
/// mutated after construction; a refresh replaces the whole value.
pub struct KeySet {
    keys: Vec<KeyEntry>,
    fetched_at: Instant,
    ttl: Duration,
}

impl KeySet {
    pub fn from_jwks(jwks: &JwkSet, ttl: Duration) -> Self {
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => keys.push(KeyEntry {
                    kid: jwk.common.key_id.clone(),
                    key,
                }),
                Err(err) => {
                    tracing::debug!(
                        kid = jwk.common.key_id.as_deref().unwrap_or(""),
                        error = %err,
                        "skipping JWK without usable key material"
                    );
                }
            }
        }

        Self {
            keys,
            fetched_at: Instant::now(),
            ttl,
        }
    }

    pub fn find(&self, kid: &str) -> Option<&KeyEntry> {
        self.keys.iter().find(|entry| entry.kid.as_deref() == Some(kid))
    }

    pub fn keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    pub fn is_stale(&self) -> bool {
        self.age() >= self.ttl
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kids = self
            .keys
            .iter()
            .map(|entry| entry.kid.as_deref().unwrap_or("<none>"))
            .collect::<Vec<_>>();
        f.debug_struct("KeySet")
            .field("kids", &kids)
            .field("age", &self.age())
            .field("ttl", &self.ttl)
            .finish()
    }
}

type PendingFetch = Shared<BoxFuture<'static, Result<Arc<KeySet>, AuthError>>>;

#[derive(Default)]
struct KeyStoreState {
    current: Option<Arc<KeySet>>,
    pending: Option<PendingFetch>,
}

struct Inner {
    policy: String,
    sources: Vec<Url>,
    ttl: Duration,
    max_wait: Duration,
    http: reqwest::Client,
    state: Mutex<KeyStoreState>,
    fetches: AtomicU64,
}

/// Cached key set for one authentication policy.
///
/// At most one fetch is in flight at a time. Callers that find the cache
/// missing or stale join the pending fetch through a shared handle and wait
/// for it at most `max_wait`; after that they continue with the stale set,
/// or fail with [`AuthError::KeyUnavailable`] when there is none. The fetch
/// itself runs on its own task, so it completes and populates the cache even
/// when every waiter has given up.
#[derive(Clone)]
pub struct KeyStore {
    inner: Arc<Inner>,
}

impl KeyStore {
    pub fn new(
        policy: &str,
        sources: Vec<Url>,
        ttl: Duration,
        max_wait: Duration,
    ) -> Result<Self, AuthError> {
        for url in &sources {
            if !matches!(url.scheme(), "http" | "https" | "file") {
                return Err(AuthError::InvalidConfig(format!(
                    "unsupported key set url scheme `{}` in {}",
                    url.scheme(),
                    url
                )));
            }
        }

        let http = reqwest::Client::builder()
            .timeout(KEY_SET_FETCH_TIMEOUT)
            .build()
            .map_err(|_| {
                AuthError::InvalidConfig("failed to initialize key set http client".to_string())
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                policy: policy.to_string(),
                sources,
                ttl,
                max_wait,
                http,
                state: Mutex::new(KeyStoreState::default()),
                fetches: AtomicU64::new(0),
            }),
        })
    }

    pub fn sources(&self) -> &[Url] {
        &self.inner.sources
    }

    /// The cached key set, fresh or stale, without triggering a fetch.
    pub fn current(&self) -> Option<Arc<KeySet>> {
        lock_state(&self.inner).current.clone()
    }

    /// Number of fetches started since construction.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Relaxed)
    }

    pub async fn key_set(&self) -> Result<Arc<KeySet>, AuthError> {
        let (cached, pending) = {
            let mut state = lock_state(&self.inner);
            if let Some(set) = state.current.as_ref()
                && !set.is_stale()
            {
                return Ok(Arc::clone(set));
            }
            let pending = self.pending_fetch(&mut state);
            (state.current.clone(), pending)
        };

        self.await_fetch(cached, pending).await
    }

    /// Refreshes regardless of freshness, joining a fetch already in flight.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, AuthError> {
        let (cached, pending) = {
            let mut state = lock_state(&self.inner);
            let pending = self.pending_fetch(&mut state);
            (state.current.clone(), pending)
        };

        self.await_fetch(cached, pending).await
    }

    fn pending_fetch(&self, state: &mut KeyStoreState) -> PendingFetch {
        if let Some(pending) = state.pending.as_ref() {
            return pending.clone();
        }

        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let result = fetch_key_set(&inner.http, &inner.sources, inner.ttl)
                .await
                .map(Arc::new);

            match &result {
                Ok(set) => tracing::info!(
                    policy = %inner.policy,
                    keys = set.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "key set refreshed"
                ),
                Err(err) => tracing::warn!(
                    policy = %inner.policy,
                    error = %err,
                    "key set refresh failed"
                ),
            }

            let mut state = lock_state(&inner);
            state.pending = None;
            if let Ok(set) = &result {
                state.current = Some(Arc::clone(set));
            }
            result
        });

        let pending = async move {
            handle
                .await
                .unwrap_or_else(|_| Err(AuthError::RefreshAborted))
        }
        .boxed()
        .shared();
        state.pending = Some(pending.clone());
        pending
    }

    async fn await_fetch(
        &self,
        cached: Option<Arc<KeySet>>,
        pending: PendingFetch,
    ) -> Result<Arc<KeySet>, AuthError> {
        match tokio::time::timeout(self.inner.max_wait, pending).await {
            Ok(Ok(set)) => Ok(set),
            Ok(Err(err)) => match cached {
                Some(set) => {
                    tracing::warn!(
                        policy = %self.inner.policy,
                        error = %err,
                        "using stale key set after failed refresh"
                    );
                    Ok(set)
                }
                None => Err(err),
            },
            Err(_) => match cached {
                Some(set) => {
                    tracing::debug!(
                        policy = %self.inner.policy,
                        "key set refresh still running; using stale key set"
                    );
                    Ok(set)
                }
                None => Err(AuthError::KeyUnavailable),
            },
        }
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("policy", &self.inner.policy)
            .field("sources", &self.inner.sources.len())
            .field("ttl", &self.inner.ttl)
            .field("max_wait", &self.inner.max_wait)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}

fn lock_state(inner: &Inner) -> MutexGuard<'_, KeyStoreState> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn fetch_key_set(
    http: &reqwest::Client,
    sources: &[Url],
    ttl: Duration,
) -> Result<KeySet, AuthError> {
    let mut merged = JwkSet { keys: Vec::new() };
    for url in sources {
        let jwks = fetch_jwks(http, url).await?;
        merged.keys.extend(jwks.keys);
    }
    Ok(KeySet::from_jwks(&merged, ttl))
}

async fn fetch_jwks(http: &reqwest::Client, url: &Url) -> Result<JwkSet, AuthError> {
    let fetch_error = |reason: String| AuthError::KeySetFetch {
        url: url.to_string(),
        reason,
    };
    let parse_error = |reason: String| AuthError::KeySetParse {
        url: url.to_string(),
        reason,
    };

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| fetch_error("not a local file path".to_string()))?;
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|err| fetch_error(err.to_string()))?;
            serde_json::from_str::<JwkSet>(&raw).map_err(|err| parse_error(err.to_string()))
        }
        "http" | "https" => {
            let resp = http
                .get(url.clone())
                .send()
                .await
                .map_err(|err| fetch_error(err.to_string()))?
                .error_for_status()
                .map_err(|err| fetch_error(err.to_string()))?;
            resp.json::<JwkSet>()
                .await
                .map_err(|err| parse_error(err.to_string()))
        }
        other => Err(fetch_error(format!("unsupported scheme `{}`", other))),
    }
}
