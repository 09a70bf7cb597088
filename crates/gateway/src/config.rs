use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub path_prefix: String,
    pub api_config_path: PathBuf,
    pub datastore_config_path: PathBuf,
    pub opa_url: String,
    pub opa_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub datastore_query_timeout_ms: u64,
    pub datastore_max_connections: u32,
    pub config_watch_interval_ms: u64,
    pub policy_dir: Option<PathBuf>,
    pub auth_policy: Option<String>,
    pub metrics_enabled: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl StartupError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("GATEHOUSE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("GATEHOUSE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8181),
            "GATEHOUSE_BIND_ADDR",
        )?;

        let path_prefix = parse_path_prefix(kv.get("GATEHOUSE_PATH_PREFIX"))?;

        let api_config_path =
            optional_string(kv, "GATEHOUSE_API_CONFIG_PATH").unwrap_or_else(|| "./api.yml".into());
        let datastore_config_path = optional_string(kv, "GATEHOUSE_DATASTORE_CONFIG_PATH")
            .unwrap_or_else(|| "./datastore.yml".into());

        let opa_url = require_nonempty(kv, "GATEHOUSE_OPA_URL")?;
        if !opa_url.starts_with("http://") && !opa_url.starts_with("https://") {
            return Err(StartupError::new(
                "ERR_INVALID_CONFIG",
                "GATEHOUSE_OPA_URL must be an http(s) URL",
            ));
        }
        let opa_url = opa_url.trim_end_matches('/').to_string();

        let opa_timeout_ms = parse_u64(
            kv.get("GATEHOUSE_OPA_TIMEOUT_MS"),
            500,
            "GATEHOUSE_OPA_TIMEOUT_MS",
        )?;
        let request_timeout_ms = parse_u64(
            kv.get("GATEHOUSE_REQUEST_TIMEOUT_MS"),
            5000,
            "GATEHOUSE_REQUEST_TIMEOUT_MS",
        )?;
        if opa_timeout_ms == 0 || request_timeout_ms == 0 {
            return Err(StartupError::new(
                "ERR_INVALID_CONFIG",
                "GATEHOUSE_OPA_TIMEOUT_MS and GATEHOUSE_REQUEST_TIMEOUT_MS must be >= 1",
            ));
        }

        let datastore_query_timeout_ms = parse_u64(
            kv.get("GATEHOUSE_DATASTORE_QUERY_TIMEOUT_MS"),
            1000,
            "GATEHOUSE_DATASTORE_QUERY_TIMEOUT_MS",
        )?;
        let datastore_max_connections = parse_u32(
            kv.get("GATEHOUSE_DATASTORE_MAX_CONNECTIONS"),
            8,
            "GATEHOUSE_DATASTORE_MAX_CONNECTIONS",
        )?;
        if datastore_max_connections == 0 {
            return Err(StartupError::new(
                "ERR_INVALID_CONFIG",
                "GATEHOUSE_DATASTORE_MAX_CONNECTIONS must be >= 1",
            ));
        }

        let config_watch_interval_ms = parse_u64(
            kv.get("GATEHOUSE_CONFIG_WATCH_INTERVAL_MS"),
            2000,
            "GATEHOUSE_CONFIG_WATCH_INTERVAL_MS",
        )?;

        let policy_dir = optional_string(kv, "GATEHOUSE_POLICY_DIR").map(PathBuf::from);
        let auth_policy = optional_string(kv, "GATEHOUSE_AUTH_POLICY");

        let metrics_enabled = match kv.get("GATEHOUSE_METRICS_ENABLED") {
            None => true,
            Some(v) if v.trim().is_empty() => true,
            Some(v) => parse_bool(Some(v)).ok_or_else(|| {
                StartupError::new(
                    "ERR_INVALID_CONFIG",
                    "GATEHOUSE_METRICS_ENABLED must be true or false",
                )
            })?,
        };

        let log_format = parse_log_format(kv.get("GATEHOUSE_LOG_FORMAT"))?;

        Ok(Self {
            bind_addr,
            path_prefix,
            api_config_path: PathBuf::from(api_config_path),
            datastore_config_path: PathBuf::from(datastore_config_path),
            opa_url,
            opa_timeout_ms,
            request_timeout_ms,
            datastore_query_timeout_ms,
            datastore_max_connections,
            config_watch_interval_ms,
            policy_dir,
            auth_policy,
            metrics_enabled,
            log_format,
        })
    }

    pub fn opa_timeout(&self) -> Duration {
        Duration::from_millis(self.opa_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn datastore_query_timeout(&self) -> Duration {
        Duration::from_millis(self.datastore_query_timeout_ms)
    }

    /// `None` when the watcher is disabled.
    pub fn config_watch_interval(&self) -> Option<Duration> {
        (self.config_watch_interval_ms > 0)
            .then(|| Duration::from_millis(self.config_watch_interval_ms))
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn optional_string(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_string(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

// Normalized to a leading slash and no trailing slash; "/" becomes "".
fn parse_path_prefix(value: Option<&String>) -> Result<String, StartupError> {
    let raw = value.map(|s| s.trim()).unwrap_or("/v1");
    if raw.is_empty() || raw == "/" {
        return Ok(String::new());
    }
    if !raw.starts_with('/') || raw.contains(['?', '#', '{', '}', '*']) {
        return Err(StartupError::new(
            "ERR_INVALID_CONFIG",
            "GATEHOUSE_PATH_PREFIX must be an absolute path without patterns",
        ));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_log_format(value: Option<&String>) -> Result<LogFormat, StartupError> {
    let format = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("text");

    match format {
        "text" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => Err(StartupError::new(
            "ERR_INVALID_CONFIG",
            "GATEHOUSE_LOG_FORMAT must be text or json",
        )),
    }
}
