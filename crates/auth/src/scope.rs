use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Claim names searched for granted scopes, in precedence order. The first
/// claim present in the token wins even if a later one is also present.
pub const SCOPE_CLAIMS: [&str; 3] = ["scope", "scp", "scopes"];

/// Decides whether a set of granted scopes satisfies one required scope.
pub trait ScopeStrategy: Send + Sync {
    fn grants(&self, granted: &[String], required: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeStrategyKind {
    Exact,
    Hierarchic,
    Wildcard,
}

impl ScopeStrategy for ScopeStrategyKind {
    fn grants(&self, granted: &[String], required: &str) -> bool {
        match self {
            ScopeStrategyKind::Exact => granted.iter().any(|scope| scope == required),
            ScopeStrategyKind::Hierarchic => granted
                .iter()
                .any(|scope| hierarchic_match(scope, required)),
            ScopeStrategyKind::Wildcard => {
                granted.iter().any(|scope| wildcard_match(scope, required))
            }
        }
    }
}

fn hierarchic_match(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    required
        .strip_prefix(granted)
        .is_some_and(|rest| rest.starts_with('.'))
}

// `a.*` grants `a.b` and `a.b.c`; `*` only matches a non-empty segment.
fn wildcard_match(granted: &str, required: &str) -> bool {
    let granted_parts = granted.split('.').collect::<Vec<_>>();
    let required_parts = required.split('.').collect::<Vec<_>>();
    if granted_parts.len() > required_parts.len() {
        return false;
    }

    let last = granted_parts.len() - 1;
    for (idx, part) in granted_parts.iter().enumerate() {
        if idx == last && granted_parts.len() != required_parts.len() && *part != "*" {
            return false;
        }
        if *part == "*" {
            if required_parts[idx].is_empty() {
                return false;
            }
            continue;
        }
        if *part != required_parts[idx] {
            return false;
        }
    }
    true
}

/// Extracts granted scopes from the first recognized scope claim. Accepts a
/// space-delimited string or an array of strings.
pub fn token_scopes(claims: &Value) -> Vec<String> {
    let Some(value) = SCOPE_CLAIMS.iter().find_map(|name| claims.get(*name)) else {
        return Vec::new();
    };

    match value {
        Value::String(s) => s.split_whitespace().map(|s| s.to_string()).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}
