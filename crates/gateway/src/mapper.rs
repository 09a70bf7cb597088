use std::collections::HashSet;

use gatehouse_contracts::{MapperOutput, RequestTarget};
use regex::Regex;
use thiserror::Error;

use crate::app_config::AppConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("routes `{first}` and `{second}` match with equal importance")]
    RouteAmbiguous { first: String, second: String },

    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route `{pattern}` targets unknown datastore `{datastore}`")]
    UnknownDatastore { pattern: String, datastore: String },

    #[error("route `{pattern}` has an empty policy package")]
    EmptyPackage { pattern: String },
}

impl MapperError {
    pub fn code(&self) -> &'static str {
        match self {
            MapperError::RouteNotFound { .. } => "ERR_ROUTE_NOT_FOUND",
            MapperError::RouteAmbiguous { .. } => "ERR_ROUTE_AMBIGUOUS",
            MapperError::InvalidPattern { .. } => "ERR_INVALID_ROUTE_PATTERN",
            MapperError::UnknownDatastore { .. } => "ERR_UNKNOWN_DATASTORE",
            MapperError::EmptyPackage { .. } => "ERR_EMPTY_PACKAGE",
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    // Human-readable form used in ambiguity errors.
    display: String,
    matcher: Regex,
    queries: Vec<String>,
    importance: usize,
    output: MapperOutput,
}

impl CompiledRoute {
    fn matches(&self, key: &str, query_names: &HashSet<&str>) -> bool {
        self.matcher.is_match(key)
            && self
                .queries
                .iter()
                .all(|name| query_names.contains(name.as_str()))
    }
}

/// Route table compiled from the `mappings` of `api.yml`. Immutable once
/// built; a reload builds a new one.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    routes: Vec<CompiledRoute>,
}

impl PathMapper {
    pub fn configure(config: &AppConfig) -> Result<Self, MapperError> {
        let mut routes = Vec::new();
        for group in &config.api.mappings {
            for mapping in &group.mappings {
                let methods = mapping
                    .methods
                    .iter()
                    .map(|m| m.trim().to_ascii_uppercase())
                    .filter(|m| !m.is_empty())
                    .collect::<Vec<_>>();
                let pattern = format!("{}{}", group.prefix, mapping.path);
                let label = if methods.is_empty() {
                    format!("*-{}", pattern)
                } else {
                    format!("{}-{}", methods.join("|"), pattern)
                };

                if !config.data.datastores.contains_key(&group.datastore) {
                    return Err(MapperError::UnknownDatastore {
                        pattern: label,
                        datastore: group.datastore.clone(),
                    });
                }
                let package = mapping.package.trim();
                if package.is_empty() {
                    return Err(MapperError::EmptyPackage { pattern: label });
                }

                let matcher = compile_matcher(&methods, &pattern)?;
                let importance = group.prefix.len()
                    + mapping.path.len()
                    + mapping.queries.len()
                    + methods.len();

                tracing::debug!(
                    route = %label,
                    importance,
                    datastore = %group.datastore,
                    package,
                    "compiled route"
                );

                routes.push(CompiledRoute {
                    display: label,
                    matcher,
                    queries: mapping.queries.clone(),
                    importance,
                    output: MapperOutput {
                        datastore: group.datastore.clone(),
                        package: package.to_string(),
                    },
                });
            }
        }

        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn map(&self, target: &RequestTarget) -> Result<MapperOutput, MapperError> {
        let key = format!("{}-{}", target.method.to_ascii_uppercase(), target.path);
        let query_names = target.query_param_names().into_iter().collect::<HashSet<_>>();

        let mut best: Option<&CompiledRoute> = None;
        let mut runner_up: Option<&CompiledRoute> = None;
        for route in self.routes.iter().filter(|r| r.matches(&key, &query_names)) {
            match best {
                Some(current) if route.importance <= current.importance => {
                    if runner_up.is_none_or(|r| route.importance > r.importance) {
                        runner_up = Some(route);
                    }
                }
                _ => {
                    runner_up = best;
                    best = Some(route);
                }
            }
        }

        let Some(best) = best else {
            return Err(MapperError::RouteNotFound {
                method: target.method.clone(),
                path: target.path.clone(),
            });
        };

        if let Some(other) = runner_up
            && other.importance == best.importance
        {
            return Err(MapperError::RouteAmbiguous {
                first: best.display.clone(),
                second: other.display.clone(),
            });
        }

        Ok(best.output.clone())
    }
}

fn compile_matcher(methods: &[String], pattern: &str) -> Result<Regex, MapperError> {
    let invalid = |reason: &str| MapperError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if !pattern.starts_with('/') {
        return Err(invalid("path must start with `/`"));
    }

    let mut regex = String::from("^");
    if methods.is_empty() {
        regex.push_str("[A-Z]+");
    } else {
        let alternation = methods
            .iter()
            .map(|m| regex::escape(m))
            .collect::<Vec<_>>()
            .join("|");
        regex.push_str(&format!("(?:{})", alternation));
    }
    regex.push('-');

    let mut rest = pattern;
    while !rest.is_empty() {
        match rest.find(['{', '}', '*']) {
            None => {
                regex.push_str(&regex::escape(rest));
                break;
            }
            Some(idx) => {
                regex.push_str(&regex::escape(&rest[..idx]));
                let tail = &rest[idx..];
                if tail.starts_with('*') {
                    regex.push_str(".*");
                    rest = &tail[1..];
                } else if tail.starts_with('}') {
                    return Err(invalid("unbalanced `}`"));
                } else {
                    let close = tail.find('}').ok_or_else(|| invalid("unclosed `{`"))?;
                    let name = &tail[1..close];
                    if name.is_empty() || name.contains(['{', '/', '*']) {
                        return Err(invalid("placeholder names must be non-empty words"));
                    }
                    regex.push_str("[^/]+");
                    rest = &tail[close + 1..];
                }
            }
        }
    }
    regex.push('$');

    Regex::new(&regex).map_err(|err| invalid(&err.to_string()))
}
