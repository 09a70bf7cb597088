use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use gatehouse_auth::JwtAuthenticator;
use gatehouse_policy::QueryTranslator;
use tokio::sync::mpsc;

use crate::app_config::AppConfig;
use crate::config::{GatewayConfig, StartupError};
use crate::datastore::{self, DatastoreMap};
use crate::mapper::PathMapper;

/// Everything derived from `api.yml` and `datastore.yml`. Requests take one
/// snapshot when they arrive and use it to completion.
pub struct Snapshot {
    pub mapper: PathMapper,
    pub authenticators: HashMap<String, JwtAuthenticator>,
    pub auth_policy: Option<String>,
    pub translator: QueryTranslator,
    pub datastores: DatastoreMap,
}

impl Snapshot {
    pub async fn build(
        app: &AppConfig,
        auth_policy: Option<&str>,
        datastores: DatastoreMap,
    ) -> Result<Self, StartupError> {
        let mapper = PathMapper::configure(app)
            .map_err(|err| StartupError::new(err.code(), err.to_string()))?;

        let schemas = app.datastore_schemas()?;
        for alias in app.data.datastores.keys() {
            if !datastores.contains_key(alias) {
                return Err(StartupError::new(
                    "ERR_INVALID_CONFIG",
                    format!("datastore `{}` has no driver", alias),
                ));
            }
        }

        let mut authenticators = HashMap::with_capacity(app.api.authentication.len());
        for (alias, auth_config) in &app.api.authentication {
            let authenticator = JwtAuthenticator::configure(auth_config.clone(), alias)
                .await
                .map_err(|err| StartupError::new(err.code(), err.to_string()))?;
            authenticators.insert(alias.clone(), authenticator);
        }

        if let Some(alias) = auth_policy
            && !authenticators.contains_key(alias)
        {
            return Err(StartupError::new(
                "ERR_INVALID_CONFIG",
                format!("GATEHOUSE_AUTH_POLICY names unknown authentication policy `{}`", alias),
            ));
        }

        Ok(Self {
            mapper,
            authenticators,
            auth_policy: auth_policy.map(str::to_string),
            translator: QueryTranslator::new(schemas),
            datastores,
        })
    }

    /// Reads the config files and connects the datastore drivers.
    pub async fn load(config: &GatewayConfig) -> Result<Self, StartupError> {
        let app = AppConfig::load(&config.api_config_path, &config.datastore_config_path)?;
        let datastores = datastore::connect_all(
            &app,
            config.datastore_max_connections,
            config.datastore_query_timeout(),
        )
        .map_err(|err| StartupError::new(err.code(), err.to_string()))?;

        let snapshot = Self::build(&app, config.auth_policy.as_deref(), datastores).await?;
        tracing::info!(
            routes = snapshot.mapper.len(),
            authentication_policies = snapshot.authenticators.len(),
            datastores = snapshot.datastores.len(),
            "configuration loaded"
        );
        Ok(snapshot)
    }

    /// The authenticator applied to every request, if one is configured.
    pub fn authenticator(&self) -> Option<&JwtAuthenticator> {
        self.auth_policy
            .as_deref()
            .and_then(|alias| self.authenticators.get(alias))
    }
}

/// Shared, swappable pointer to the live [`Snapshot`].
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Snapshot>>>,
    generation: Arc<AtomicU64>,
}

impl ConfigHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(snapshot))),
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Publishes `snapshot`. In-flight requests keep the one they hold.
    pub fn swap(&self, snapshot: Snapshot) -> u64 {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// `api.yml` or `datastore.yml` changed; rebuild everything.
    All,
    /// Only the policy bundle directory changed. The policy engine serves its
    /// own bundle, so nothing here needs rebuilding.
    PolicyBundle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Swapped { generation: u64 },
    Ignored,
    Failed,
}

/// Applies one change notification. A failed rebuild leaves the live
/// snapshot untouched.
pub async fn apply_change<F, Fut>(handle: &ConfigHandle, change: ChangeKind, rebuild: F) -> ReloadOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Snapshot, StartupError>>,
{
    match change {
        ChangeKind::PolicyBundle => {
            tracing::info!("policy bundle changed; configuration snapshot kept");
            crate::metrics::observe_config_reload("ignored");
            ReloadOutcome::Ignored
        }
        ChangeKind::All => match rebuild().await {
            Ok(snapshot) => {
                let generation = handle.swap(snapshot);
                tracing::info!(generation, "configuration reloaded");
                crate::metrics::observe_config_reload("success");
                ReloadOutcome::Swapped { generation }
            }
            Err(err) => {
                tracing::error!(
                    code = err.code,
                    error = %err.message,
                    "configuration reload failed; keeping previous snapshot"
                );
                crate::metrics::observe_config_reload("failure");
                ReloadOutcome::Failed
            }
        },
    }
}

/// Polls file modification times and reports what changed since the last
/// poll.
#[derive(Debug)]
pub struct ConfigWatcher {
    config_files: Vec<PathBuf>,
    policy_dir: Option<PathBuf>,
    last_config: Vec<Option<SystemTime>>,
    last_policy: Option<(usize, SystemTime)>,
}

impl ConfigWatcher {
    pub fn new(config_files: Vec<PathBuf>, policy_dir: Option<PathBuf>) -> Self {
        let last_config = config_files.iter().map(|p| modified(p)).collect();
        let last_policy = policy_dir.as_deref().and_then(newest_modified);
        Self {
            config_files,
            policy_dir,
            last_config,
            last_policy,
        }
    }

    pub fn poll(&mut self) -> Option<ChangeKind> {
        let config = self
            .config_files
            .iter()
            .map(|p| modified(p))
            .collect::<Vec<_>>();
        let policy = self.policy_dir.as_deref().and_then(newest_modified);

        let config_changed = config != self.last_config;
        let policy_changed = policy != self.last_policy;
        self.last_config = config;
        self.last_policy = policy;

        if config_changed {
            Some(ChangeKind::All)
        } else if policy_changed {
            Some(ChangeKind::PolicyBundle)
        } else {
            None
        }
    }

    pub fn spawn(mut self, interval: Duration, tx: mpsc::Sender<ChangeKind>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Some(change) = self.poll() {
                    tracing::debug!(?change, "configuration change detected");
                    if tx.send(change).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

/// Runs the watcher and applies its notifications until the process exits.
pub fn spawn_reloader(handle: ConfigHandle, config: Arc<GatewayConfig>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = config.config_watch_interval()?;

    let watcher = ConfigWatcher::new(
        vec![
            config.api_config_path.clone(),
            config.datastore_config_path.clone(),
        ],
        config.policy_dir.clone(),
    );
    let (tx, mut rx) = mpsc::channel(8);
    watcher.spawn(interval, tx);

    Some(tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            apply_change(&handle, change, || Snapshot::load(&config)).await;
        }
    }))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Entry count and newest modification time of a policy directory.
fn newest_modified(dir: &Path) -> Option<(usize, SystemTime)> {
    let own = modified(dir)?;
    let mut count = 0;
    let mut newest = own;
    for entry in std::fs::read_dir(dir).ok()?.filter_map(Result::ok) {
        count += 1;
        if let Some(time) = modified(&entry.path()) {
            newest = newest.max(time);
        }
    }
    Some((count, newest))
}
