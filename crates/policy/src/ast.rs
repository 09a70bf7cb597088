use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Number;

/// One term of a partially evaluated query, in the policy engine's JSON AST
/// encoding (`{"type": "...", "value": ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Term {
    Null,
    Boolean(bool),
    Number(Number),
    String(String),
    Var(String),
    Ref(Vec<Term>),
    Call(Vec<Term>),
    Array(Vec<Term>),
    Set(Vec<Term>),
    Object(Vec<(Term, Term)>),
}

impl Term {
    pub fn var(name: &str) -> Self {
        Term::Var(name.to_string())
    }

    pub fn string(value: &str) -> Self {
        Term::String(value.to_string())
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Term::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_ref_path(&self) -> Option<&[Term]> {
        match self {
            Term::Ref(path) => Some(path),
            _ => None,
        }
    }

    /// The name of a builtin operator reference such as `eq` or
    /// `internal.member_2`.
    pub fn operator_name(&self) -> Option<String> {
        let path = self.as_ref_path()?;
        let mut parts = Vec::with_capacity(path.len());
        for (idx, segment) in path.iter().enumerate() {
            match segment {
                Term::Var(name) if idx == 0 => parts.push(name.as_str()),
                Term::String(name) if idx > 0 => parts.push(name.as_str()),
                _ => return None,
            }
        }
        Some(parts.join("."))
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Null => f.write_str("null"),
            Term::Boolean(value) => write!(f, "{}", value),
            Term::Number(value) => write!(f, "{}", value),
            Term::String(value) => write!(f, "{:?}", value),
            Term::Var(name) => f.write_str(name),
            Term::Ref(path) => write_ref(f, path),
            Term::Call(terms) => {
                let Some((operator, args)) = terms.split_first() else {
                    return f.write_str("<empty call>");
                };
                write!(f, "{}(", operator)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Term::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Term::Set(items) => {
                f.write_str("{")?;
                write_list(f, items)?;
                f.write_str("}")
            }
            Term::Object(pairs) => {
                f.write_str("{")?;
                for (idx, (key, value)) in pairs.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_ref(f: &mut fmt::Formatter<'_>, path: &[Term]) -> fmt::Result {
    let Some((head, rest)) = path.split_first() else {
        return Ok(());
    };
    write!(f, "{}", head)?;
    for segment in rest {
        match segment {
            Term::String(name) if is_identifier(name) => write!(f, ".{}", name)?,
            other => write!(f, "[{}]", other)?,
        }
    }
    Ok(())
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Operands of one expression: an operator call (`[operator, args..]`) or a
/// single term evaluated for truthiness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExprTerms {
    Call(Vec<Term>),
    Term(Term),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negated: bool,
    pub terms: ExprTerms,
}

impl Expr {
    pub fn call(index: usize, operator: &str, args: Vec<Term>) -> Self {
        let mut terms = Vec::with_capacity(args.len() + 1);
        terms.push(Term::Ref(vec![Term::var(operator)]));
        terms.extend(args);
        Self {
            index,
            negated: false,
            terms: ExprTerms::Call(terms),
        }
    }

    pub fn term(index: usize, term: Term) -> Self {
        Self {
            index,
            negated: false,
            terms: ExprTerms::Term(term),
        }
    }

    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("not ")?;
        }
        match &self.terms {
            ExprTerms::Term(term) => write!(f, "{}", term),
            ExprTerms::Call(terms) => {
                let Some((operator, args)) = terms.split_first() else {
                    return Ok(());
                };
                write!(f, "{}(", operator)?;
                write_list(f, args)?;
                f.write_str(")")
            }
        }
    }
}

/// Conjunction of expressions. Alternatives are returned as a `Vec<QueryBody>`
/// and combined disjunctively.
pub type QueryBody = Vec<Expr>;

/// Builds `head.segment[..]` where segments starting with `$` or wrapped in
/// brackets become variables. Used to write compact fixtures and logs.
pub fn parse_ref(text: &str) -> Term {
    let mut path = Vec::new();
    for (idx, raw) in text.split('.').enumerate() {
        let (name, vars) = match raw.find('[') {
            Some(open) => (&raw[..open], &raw[open..]),
            None => (raw, ""),
        };
        if idx == 0 {
            path.push(Term::var(name));
        } else if !name.is_empty() {
            path.push(Term::string(name));
        }
        for var in vars.split(['[', ']']).filter(|v| !v.is_empty()) {
            path.push(Term::var(var));
        }
    }
    Term::Ref(path)
}
