use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{Expr, ExprTerms, QueryBody, Term};
use crate::translate::DATA_ROOT;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PreprocessError {
    #[error("unsupported reference `{reference}`: row identifier must be an iterator variable")]
    UnsupportedReference { reference: String },

    #[error("table `{table}` is iterated by both `{first}` and `{second}`; self-links are not supported")]
    SelfLinkUnsupported {
        table: String,
        first: String,
        second: String,
    },
}

impl PreprocessError {
    pub fn code(&self) -> &'static str {
        match self {
            PreprocessError::UnsupportedReference { .. } => "ERR_UNSUPPORTED_REFERENCE",
            PreprocessError::SelfLinkUnsupported { .. } => "ERR_SELF_LINK_UNSUPPORTED",
        }
    }
}

/// Rewrites `source.table[iter].column` references into iterator-free
/// `source.table.column` paths.
///
/// Holds no state between calls: every body gets a fresh [`BodyScope`], so
/// one preprocessor can be shared across concurrent requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefPreprocessor;

impl RefPreprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Processes every body, failing on the first body that cannot be
    /// normalized. Output order matches input order.
    pub fn process(&self, bodies: Vec<QueryBody>) -> Result<Vec<QueryBody>, PreprocessError> {
        bodies
            .into_iter()
            .map(|body| self.process_body(body))
            .collect()
    }

    pub fn process_body(&self, body: QueryBody) -> Result<QueryBody, PreprocessError> {
        let mut scope = BodyScope::default();
        body.into_iter()
            .map(|expr| scope.rewrite_expr(expr))
            .collect()
    }
}

/// Iterator bindings and table usage for one query body.
#[derive(Debug, Default)]
struct BodyScope {
    // iterator var -> `[source, table]`
    bindings: HashMap<String, Vec<Term>>,
    // table -> iterator var
    usage: HashMap<String, String>,
}

impl BodyScope {
    fn rewrite_expr(&mut self, expr: Expr) -> Result<Expr, PreprocessError> {
        let terms = match expr.terms {
            ExprTerms::Term(term) => ExprTerms::Term(self.rewrite_term(term)?),
            ExprTerms::Call(terms) => ExprTerms::Call(self.rewrite_call(terms)?),
        };
        Ok(Expr { terms, ..expr })
    }

    // The operator of a call is a name, not a table access.
    fn rewrite_call(&mut self, terms: Vec<Term>) -> Result<Vec<Term>, PreprocessError> {
        let mut out = Vec::with_capacity(terms.len());
        let mut iter = terms.into_iter();
        if let Some(operator) = iter.next() {
            out.push(operator);
        }
        for term in iter {
            out.push(self.rewrite_term(term)?);
        }
        Ok(out)
    }

    fn rewrite_term(&mut self, term: Term) -> Result<Term, PreprocessError> {
        match term {
            Term::Ref(path) => {
                let path = path
                    .into_iter()
                    .enumerate()
                    .map(|(idx, segment)| match segment {
                        Term::Var(_) if idx == 0 => Ok(segment),
                        other => self.rewrite_term(other),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                self.rewrite_ref(path).map(Term::Ref)
            }
            Term::Call(terms) => self.rewrite_call(terms).map(Term::Call),
            Term::Array(items) => self.rewrite_all(items).map(Term::Array),
            Term::Set(items) => self.rewrite_all(items).map(Term::Set),
            Term::Object(pairs) => {
                let mut out = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    out.push((self.rewrite_term(key)?, self.rewrite_term(value)?));
                }
                Ok(Term::Object(out))
            }
            scalar => Ok(scalar),
        }
    }

    fn rewrite_all(&mut self, items: Vec<Term>) -> Result<Vec<Term>, PreprocessError> {
        items
            .into_iter()
            .map(|item| self.rewrite_term(item))
            .collect()
    }

    fn rewrite_ref(&mut self, path: Vec<Term>) -> Result<Vec<Term>, PreprocessError> {
        // Operands such as a bare `x` carry no table access.
        if path.len() <= 1 {
            return Ok(path);
        }

        // `data.foo[x]; x.bar` becomes `data.foo.bar`.
        if let Some(head) = path[0].as_var()
            && let Some(prefix) = self.bindings.get(head)
        {
            let mut expanded = prefix.clone();
            expanded.extend(path.into_iter().skip(1));
            return Ok(expanded);
        }

        let iterator = path.get(2).and_then(Term::as_var).map(str::to_string);
        let Some(iterator) = iterator else {
            if is_normalized(&path) {
                return Ok(path);
            }
            tracing::debug!(reference = %Term::Ref(path.clone()), "row identifier is not an iterator");
            return Err(PreprocessError::UnsupportedReference {
                reference: Term::Ref(path).to_string(),
            });
        };

        let Some(table) = table_name(&path[1]) else {
            return Err(PreprocessError::UnsupportedReference {
                reference: Term::Ref(path).to_string(),
            });
        };

        match self.usage.get(&table) {
            Some(existing) if *existing != iterator => {
                return Err(PreprocessError::SelfLinkUnsupported {
                    table,
                    first: existing.clone(),
                    second: iterator,
                });
            }
            Some(_) => {}
            None => {
                self.usage.insert(table, iterator.clone());
            }
        }

        let mut segments = path.into_iter();
        let prefix = segments.by_ref().take(2).collect::<Vec<_>>();
        self.bindings.insert(iterator, prefix.clone());

        let mut rewritten = prefix;
        rewritten.extend(segments.skip(1));
        Ok(rewritten)
    }
}

// `data.table.column` with a named column, or a local ref free of variables.
fn is_normalized(path: &[Term]) -> bool {
    if path[1..].iter().any(|segment| segment.as_var().is_some()) {
        return false;
    }
    if path[0].as_var() != Some(DATA_ROOT) {
        return true;
    }
    path.get(2)
        .is_none_or(|segment| matches!(segment, Term::String(_)))
}

fn table_name(segment: &Term) -> Option<String> {
    match segment {
        Term::String(name) | Term::Var(name) => Some(name.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::parse_ref;

    fn eq(index: usize, lhs: &str, rhs: Term) -> Expr {
        eq_term(index, parse_ref(lhs), rhs)
    }

    fn eq_term(index: usize, lhs: Term, rhs: Term) -> Expr {
        Expr::call(index, "eq", vec![lhs, rhs])
    }

    #[test]
    fn strips_iterator_segment() {
        let body = vec![
            eq(0, "data.pets[$01].owner", Term::string("alice")),
            eq(1, "data.pets[$01].kind", Term::string("dog")),
        ];

        let out = RefPreprocessor::new().process_body(body).expect("normalizes");
        assert_eq!(
            out,
            vec![
                eq(0, "data.pets.owner", Term::string("alice")),
                eq(1, "data.pets.kind", Term::string("dog")),
            ]
        );
    }

    #[test]
    fn expands_iterator_used_as_head() {
        let body = vec![
            Expr::term(0, parse_ref("data.pets[x]")),
            eq(1, "x.owner", Term::string("alice")),
        ];

        let out = RefPreprocessor::new().process_body(body).expect("normalizes");
        assert_eq!(out[0], Expr::term(0, parse_ref("data.pets")));
        assert_eq!(out[1], eq(1, "data.pets.owner", Term::string("alice")));
    }

    #[test]
    fn rewrites_refs_nested_in_calls() {
        let body = vec![Expr::call(
            0,
            "gt",
            vec![
                Term::Call(vec![
                    parse_ref("plus"),
                    parse_ref("data.pets[x].age"),
                    Term::Number(1.into()),
                ]),
                Term::Number(3.into()),
            ],
        )
        .negate()];

        let out = RefPreprocessor::new().process_body(body).expect("normalizes");
        assert!(out[0].negated);
        assert_eq!(out[0].to_string(), "not gt(plus(data.pets.age, 1), 3)");
    }

    #[test]
    fn self_link_is_rejected() {
        let body = vec![
            eq(0, "data.pets[x].owner", Term::string("alice")),
            Expr::call(
                1,
                "eq",
                vec![parse_ref("data.pets[x].id"), parse_ref("data.pets[y].parent")],
            ),
        ];

        let err = RefPreprocessor::new().process_body(body).unwrap_err();
        assert_eq!(
            err,
            PreprocessError::SelfLinkUnsupported {
                table: "pets".to_string(),
                first: "x".to_string(),
                second: "y".to_string(),
            }
        );
    }

    #[test]
    fn same_table_in_separate_bodies_is_fine() {
        let bodies = vec![
            vec![eq(0, "data.pets[x].owner", Term::string("alice"))],
            vec![eq(0, "data.pets[y].owner", Term::string("bob"))],
        ];

        let out = RefPreprocessor::new().process(bodies).expect("normalizes");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], vec![eq(0, "data.pets.owner", Term::string("bob"))]);
    }

    #[test]
    fn literal_row_identifier_is_unsupported() {
        let path = vec![
            Term::var("data"),
            Term::string("pets"),
            Term::Number(1.into()),
            Term::var("y"),
        ];
        let body = vec![Expr::term(0, Term::Ref(path))];

        let err = RefPreprocessor::new().process_body(body).unwrap_err();
        assert!(matches!(err, PreprocessError::UnsupportedReference { .. }));
        assert_eq!(err.code(), "ERR_UNSUPPORTED_REFERENCE");
    }

    #[test]
    fn literal_row_identifier_without_trailing_var_is_unsupported() {
        let table = || vec![Term::var("data"), Term::string("pets")];
        let mut indexed_column = table();
        indexed_column.extend([Term::Number(0.into()), Term::string("owner")]);
        let mut indexed_row = table();
        indexed_row.push(Term::Number(0.into()));
        let mut flagged_column = table();
        flagged_column.extend([Term::Boolean(true), Term::string("owner")]);

        for path in [indexed_column, indexed_row, flagged_column] {
            let body = vec![eq_term(0, Term::Ref(path), Term::string("alice"))];
            let err = RefPreprocessor::new().process_body(body).unwrap_err();
            assert!(matches!(err, PreprocessError::UnsupportedReference { .. }), "{err:?}");
        }
    }

    #[test]
    fn variable_free_local_refs_pass_through() {
        let body = vec![eq_term(0, parse_ref("input.subject.name"), Term::string("alice"))];
        let out = RefPreprocessor::new().process_body(body.clone()).expect("process");
        assert_eq!(out, body);
    }

    #[test]
    fn normalized_input_is_a_fixed_point() {
        let bodies = vec![
            vec![
                eq(0, "data.pets[x].owner", Term::string("alice")),
                Expr::term(1, parse_ref("x.adopted")).negate(),
                Expr::call(2, "lt", vec![parse_ref("data.owners[o].age"), Term::Number(30.into())]),
            ],
            vec![Expr::call(0, "eq", vec![parse_ref("y"), Term::Boolean(true)])],
        ];

        let preprocessor = RefPreprocessor::new();
        let once = preprocessor.process(bodies).expect("first pass");
        let twice = preprocessor.process(once.clone()).expect("second pass");
        assert_eq!(once, twice);
    }
}
