use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Number;
use thiserror::Error;

use crate::ast::{Expr, ExprTerms, QueryBody, Term};

/// Head segment that resolves to the datastore the request was routed to.
pub const DATA_ROOT: &str = "data";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("reference `{reference}` is not of the form source.table.column")]
    UnsupportedReference { reference: String },

    #[error("reference source `{source_name}` is neither `data` nor a configured datastore")]
    UnknownDatastore { source_name: String },

    #[error("entity `{entity}` is not declared for datastore `{datastore}`")]
    UnknownEntity { datastore: String, entity: String },

    #[error("query body spans datastores `{first}` and `{second}`")]
    CrossDatastore { first: String, second: String },

    #[error("operator `{operator}` is not supported")]
    UnsupportedOperator { operator: String },

    #[error("operand `{operand}` is not supported")]
    UnsupportedOperand { operand: String },
}

impl TranslateError {
    pub fn code(&self) -> &'static str {
        match self {
            TranslateError::UnsupportedReference { .. } => "ERR_UNSUPPORTED_REFERENCE",
            TranslateError::UnknownDatastore { .. } => "ERR_UNKNOWN_DATASTORE",
            TranslateError::UnknownEntity { .. } => "ERR_UNKNOWN_ENTITY",
            TranslateError::CrossDatastore { .. } => "ERR_CROSS_DATASTORE",
            TranslateError::UnsupportedOperator { .. } => "ERR_UNSUPPORTED_OPERATOR",
            TranslateError::UnsupportedOperand { .. } => "ERR_UNSUPPORTED_OPERAND",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn qualified(&self, dialect: SqlDialect) -> String {
        format!(
            "{}.{}",
            dialect.quote_ident(&self.schema),
            dialect.quote_ident(&self.table)
        )
    }
}

/// SQL flavour of a datastore: identifier quoting, placeholders and LIKE
/// escaping differ between engines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SqlDialect {
    #[default]
    Postgres,
    Mysql,
}

impl SqlDialect {
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("\"{}\"", ident.replace('"', "\"\"")),
            SqlDialect::Mysql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// Placeholder for the 1-based parameter `n`.
    pub fn placeholder(self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", n),
            SqlDialect::Mysql => "?".to_string(),
        }
    }

    // MySQL already treats `\` as the LIKE escape character.
    fn like_escape(self) -> &'static str {
        match self {
            SqlDialect::Postgres => " ESCAPE '\\'",
            SqlDialect::Mysql => "",
        }
    }
}

/// Entities a datastore exposes to policies, keyed by the name policies use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatastoreSchema {
    dialect: SqlDialect,
    entities: HashMap<String, TableRef>,
}

impl DatastoreSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            entities: HashMap::new(),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    /// Returns the previous table when `alias` was already declared.
    pub fn insert(&mut self, alias: &str, table: TableRef) -> Option<TableRef> {
        self.entities.insert(alias.to_string(), table)
    }

    pub fn resolve(&self, alias: &str) -> Option<&TableRef> {
        self.entities.get(alias)
    }

    pub fn entity_aliases(&self) -> Vec<&str> {
        let mut aliases = self.entities.keys().map(String::as_str).collect::<Vec<_>>();
        aliases.sort_unstable();
        aliases
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreQuery {
    pub datastore: String,
    pub dialect: SqlDialect,
    /// A single boolean-valued `SELECT` with one placeholder per bind.
    pub sql: String,
    pub binds: Vec<SqlValue>,
    parts: Vec<SqlPart>,
}

impl StoreQuery {
    /// Text parameters compared directly against a column, as
    /// `(parameter number, table, column)`.
    pub fn text_comparisons(&self) -> impl Iterator<Item = (usize, &TableRef, &str)> {
        self.parts.iter().filter_map(|part| match part {
            SqlPart::Param {
                n,
                column: Some(column),
            } if matches!(self.binds.get(n - 1), Some(SqlValue::Text(_))) => {
                Some((*n, &column.table, column.name.as_str()))
            }
            _ => None,
        })
    }

    /// Renders the statement with `CAST(<placeholder> AS <type>)` wherever
    /// `casts[n - 1]` names a type for parameter `n`.
    pub fn sql_with_casts(&self, casts: &[Option<String>]) -> String {
        render(self.dialect, &self.parts, casts)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SqlPart {
    Text(String),
    Param {
        // 1-based
        n: usize,
        column: Option<Column>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Translation {
    Allow,
    Deny,
    /// Allow iff any of the queries yields `true`.
    Query(Vec<StoreQuery>),
}

#[derive(Debug, Clone, PartialEq)]
struct Column {
    table: TableRef,
    name: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Column(Column),
    Value(SqlValue),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Compare {
        lhs: Operand,
        op: &'static str,
        rhs: Operand,
    },
    IsNull {
        operand: Operand,
        negated: bool,
    },
    Like {
        column: Column,
        pattern: String,
    },
    Column(Column),
    Literal(bool),
    Not(Box<Predicate>),
}

/// Translation of one query body, before bodies are grouped per datastore.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyPlan {
    /// Every expression of the body folded to `true`.
    Unconditional,
    /// Some expression folded to `false`; the branch never holds.
    Unsatisfiable,
    Conditional(ConditionalPlan),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalPlan {
    datastore: String,
    dialect: SqlDialect,
    tables: Vec<TableRef>,
    predicates: Vec<Predicate>,
}

impl ConditionalPlan {
    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.tables
    }
}

/// Turns normalized query bodies into per-datastore SQL. Bodies are OR-ed,
/// expressions inside a body are AND-ed.
#[derive(Debug, Clone, Default)]
pub struct QueryTranslator {
    schemas: HashMap<String, DatastoreSchema>,
}

impl QueryTranslator {
    pub fn new(schemas: HashMap<String, DatastoreSchema>) -> Self {
        Self { schemas }
    }

    pub fn schema(&self, datastore: &str) -> Option<&DatastoreSchema> {
        self.schemas.get(datastore)
    }

    /// `data.<entity>` for every entity of `datastore`, sorted.
    pub fn unknowns(&self, datastore: &str) -> Vec<String> {
        self.schema(datastore)
            .map(|schema| {
                schema
                    .entity_aliases()
                    .into_iter()
                    .map(|alias| format!("{}.{}", DATA_ROOT, alias))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Fails on the first body that cannot be translated.
    pub fn translate(
        &self,
        datastore: &str,
        bodies: &[QueryBody],
    ) -> Result<Translation, TranslateError> {
        let plans = bodies
            .iter()
            .map(|body| self.plan_body(datastore, body))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::assemble(plans))
    }

    pub fn plan_body(&self, datastore: &str, body: &QueryBody) -> Result<BodyPlan, TranslateError> {
        let mut planner = BodyPlanner {
            translator: self,
            routed: datastore,
            datastore: None,
            tables: Vec::new(),
        };

        let mut predicates = Vec::with_capacity(body.len());
        for expr in body {
            match planner.expr(expr)? {
                Predicate::Literal(true) => {}
                Predicate::Literal(false) => {
                    tracing::debug!(datastore, index = expr.index, "query body can never hold");
                    return Ok(BodyPlan::Unsatisfiable);
                }
                predicate => predicates.push(predicate),
            }
        }

        match planner.datastore {
            Some(datastore) => Ok(BodyPlan::Conditional(ConditionalPlan {
                dialect: self
                    .schema(&datastore)
                    .map(DatastoreSchema::dialect)
                    .unwrap_or_default(),
                datastore,
                tables: planner.tables,
                predicates,
            })),
            None if predicates.is_empty() => Ok(BodyPlan::Unconditional),
            // Only column predicates survive folding, and they set the datastore.
            None => Err(TranslateError::UnsupportedOperand {
                operand: body
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            }),
        }
    }

    /// Any unconditional plan means allow; no satisfiable plan means deny.
    pub fn assemble(plans: Vec<BodyPlan>) -> Translation {
        let mut grouped: Vec<(String, Vec<ConditionalPlan>)> = Vec::new();
        for plan in plans {
            let plan = match plan {
                BodyPlan::Unconditional => return Translation::Allow,
                BodyPlan::Unsatisfiable => continue,
                BodyPlan::Conditional(plan) => plan,
            };
            match grouped.iter_mut().find(|(ds, _)| *ds == plan.datastore) {
                Some((_, group)) => group.push(plan),
                None => grouped.push((plan.datastore.clone(), vec![plan])),
            }
        }

        if grouped.is_empty() {
            return Translation::Deny;
        }
        Translation::Query(
            grouped
                .into_iter()
                .map(|(datastore, group)| render_store_query(datastore, &group))
                .collect(),
        )
    }
}

struct BodyPlanner<'a> {
    translator: &'a QueryTranslator,
    routed: &'a str,
    datastore: Option<String>,
    tables: Vec<TableRef>,
}

impl BodyPlanner<'_> {
    fn expr(&mut self, expr: &Expr) -> Result<Predicate, TranslateError> {
        let predicate = match &expr.terms {
            ExprTerms::Term(term) => self.truth(term)?,
            ExprTerms::Call(terms) => self.call(terms)?,
        };
        Ok(match (expr.negated, predicate) {
            (false, predicate) => predicate,
            (true, Predicate::Literal(value)) => Predicate::Literal(!value),
            (true, predicate) => Predicate::Not(Box::new(predicate)),
        })
    }

    fn truth(&mut self, term: &Term) -> Result<Predicate, TranslateError> {
        match term {
            Term::Boolean(value) => Ok(Predicate::Literal(*value)),
            Term::Ref(path) if path.len() > 1 => Ok(Predicate::Column(self.column(path)?)),
            other => Err(TranslateError::UnsupportedOperand {
                operand: other.to_string(),
            }),
        }
    }

    fn call(&mut self, terms: &[Term]) -> Result<Predicate, TranslateError> {
        let Some((operator, args)) = terms.split_first() else {
            return Err(TranslateError::UnsupportedOperator {
                operator: String::new(),
            });
        };
        let name = operator
            .operator_name()
            .ok_or_else(|| TranslateError::UnsupportedOperator {
                operator: operator.to_string(),
            })?;

        let [lhs, rhs] = args else {
            return Err(TranslateError::UnsupportedOperator { operator: name });
        };

        let op = match name.as_str() {
            "eq" | "equal" => "=",
            "neq" => "<>",
            "lt" => "<",
            "lte" => "<=",
            "gt" => ">",
            "gte" => ">=",
            "startswith" | "endswith" | "contains" => return self.like(&name, lhs, rhs),
            _ => return Err(TranslateError::UnsupportedOperator { operator: name }),
        };

        let unsupported = || TranslateError::UnsupportedOperand {
            operand: format!("{} {} {}", lhs, op, rhs),
        };
        match (self.operand(lhs)?, self.operand(rhs)?) {
            (Operand::Null, Operand::Null) => Ok(Predicate::Literal(op == "=")),
            (Operand::Value(lhs), Operand::Value(rhs)) => compare_values(&lhs, op, &rhs)
                .map(Predicate::Literal)
                .ok_or_else(unsupported),
            // A value is never null.
            (Operand::Null, Operand::Value(_)) | (Operand::Value(_), Operand::Null)
                if matches!(op, "=" | "<>") =>
            {
                Ok(Predicate::Literal(op == "<>"))
            }
            (Operand::Null, operand) | (operand, Operand::Null) => match op {
                "=" => Ok(Predicate::IsNull {
                    operand,
                    negated: false,
                }),
                "<>" => Ok(Predicate::IsNull {
                    operand,
                    negated: true,
                }),
                _ => Err(TranslateError::UnsupportedOperator { operator: name }),
            },
            (lhs, rhs) => Ok(Predicate::Compare { lhs, op, rhs }),
        }
    }

    fn like(&mut self, name: &str, lhs: &Term, rhs: &Term) -> Result<Predicate, TranslateError> {
        let Term::Ref(path) = lhs else {
            return Err(TranslateError::UnsupportedOperand {
                operand: lhs.to_string(),
            });
        };
        let Term::String(needle) = rhs else {
            return Err(TranslateError::UnsupportedOperand {
                operand: rhs.to_string(),
            });
        };

        let column = self.column(path)?;
        let escaped = escape_like(needle);
        let pattern = match name {
            "startswith" => format!("{}%", escaped),
            "endswith" => format!("%{}", escaped),
            _ => format!("%{}%", escaped),
        };
        Ok(Predicate::Like { column, pattern })
    }

    fn operand(&mut self, term: &Term) -> Result<Operand, TranslateError> {
        match term {
            Term::Ref(path) if path.len() > 1 => Ok(Operand::Column(self.column(path)?)),
            Term::String(value) => Ok(Operand::Value(SqlValue::Text(value.clone()))),
            Term::Boolean(value) => Ok(Operand::Value(SqlValue::Bool(*value))),
            Term::Number(value) => number_value(value)
                .map(Operand::Value)
                .ok_or_else(|| TranslateError::UnsupportedOperand {
                    operand: value.to_string(),
                }),
            Term::Null => Ok(Operand::Null),
            other => Err(TranslateError::UnsupportedOperand {
                operand: other.to_string(),
            }),
        }
    }

    fn column(&mut self, path: &[Term]) -> Result<Column, TranslateError> {
        let unsupported = || TranslateError::UnsupportedReference {
            reference: Term::Ref(path.to_vec()).to_string(),
        };

        let [Term::Var(source), Term::String(entity), Term::String(column)] = path else {
            return Err(unsupported());
        };

        let datastore = if source == DATA_ROOT {
            self.routed
        } else if self.translator.schemas.contains_key(source) {
            source.as_str()
        } else {
            return Err(TranslateError::UnknownDatastore {
                source_name: source.clone(),
            });
        };

        if let Some(first) = self.datastore.as_deref()
            && first != datastore
        {
            return Err(TranslateError::CrossDatastore {
                first: first.to_string(),
                second: datastore.to_string(),
            });
        }
        if self.datastore.is_none() {
            self.datastore = Some(datastore.to_string());
        }

        let table = self
            .translator
            .schema(datastore)
            .and_then(|schema| schema.resolve(entity))
            .ok_or_else(|| TranslateError::UnknownEntity {
                datastore: datastore.to_string(),
                entity: entity.clone(),
            })?;

        if !self.tables.contains(table) {
            self.tables.push(table.clone());
        }

        Ok(Column {
            table: table.clone(),
            name: column.clone(),
        })
    }
}

fn number_value(value: &Number) -> Option<SqlValue> {
    if let Some(int) = value.as_i64() {
        return Some(SqlValue::Int(int));
    }
    value.as_f64().map(SqlValue::Float)
}

/// Evaluates a comparison between two literals. Values of different kinds
/// are never equal and have no order.
fn compare_values(lhs: &SqlValue, op: &str, rhs: &SqlValue) -> Option<bool> {
    let ordering = match (lhs, rhs) {
        (SqlValue::Text(a), SqlValue::Text(b)) => Some(a.cmp(b)),
        (SqlValue::Bool(a), SqlValue::Bool(b)) => Some(a.cmp(b)),
        (SqlValue::Int(a), SqlValue::Int(b)) => Some(a.cmp(b)),
        (SqlValue::Int(a), SqlValue::Float(b)) => (*a as f64).partial_cmp(b),
        (SqlValue::Float(a), SqlValue::Int(b)) => a.partial_cmp(&(*b as f64)),
        (SqlValue::Float(a), SqlValue::Float(b)) => a.partial_cmp(b),
        _ => None,
    };
    match (op, ordering) {
        ("=", ordering) => Some(ordering == Some(Ordering::Equal)),
        ("<>", ordering) => Some(ordering != Some(Ordering::Equal)),
        ("<", Some(ordering)) => Some(ordering.is_lt()),
        ("<=", Some(ordering)) => Some(ordering.is_le()),
        (">", Some(ordering)) => Some(ordering.is_gt()),
        (">=", Some(ordering)) => Some(ordering.is_ge()),
        _ => None,
    }
}

struct SqlWriter {
    dialect: SqlDialect,
    parts: Vec<SqlPart>,
    binds: Vec<SqlValue>,
}

impl SqlWriter {
    fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            parts: Vec::new(),
            binds: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        match self.parts.last_mut() {
            Some(SqlPart::Text(buf)) => buf.push_str(text),
            _ => self.parts.push(SqlPart::Text(text.to_string())),
        }
    }

    fn bind(&mut self, value: SqlValue, column: Option<&Column>) {
        self.binds.push(value);
        self.parts.push(SqlPart::Param {
            n: self.binds.len(),
            column: column.cloned(),
        });
    }

    fn column(&mut self, column: &Column) {
        let qualified = column.table.qualified(self.dialect);
        let name = self.dialect.quote_ident(&column.name);
        self.push(&qualified);
        self.push(".");
        self.push(&name);
    }

    // `other` is the column on the opposite side of a comparison, if any.
    fn operand(&mut self, operand: &Operand, other: &Operand) {
        match operand {
            Operand::Column(column) => self.column(column),
            Operand::Value(value) => {
                let compared = match other {
                    Operand::Column(column) => Some(column),
                    _ => None,
                };
                self.bind(value.clone(), compared)
            }
            Operand::Null => self.push("NULL"),
        }
    }

    fn predicate(&mut self, predicate: &Predicate) {
        match predicate {
            Predicate::Compare { lhs, op, rhs } => {
                self.operand(lhs, rhs);
                self.push(" ");
                self.push(op);
                self.push(" ");
                self.operand(rhs, lhs);
            }
            Predicate::IsNull { operand, negated } => {
                self.operand(operand, &Operand::Null);
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Predicate::Like { column, pattern } => {
                self.column(column);
                self.push(" LIKE ");
                self.bind(SqlValue::Text(pattern.clone()), None);
                self.push(self.dialect.like_escape());
            }
            Predicate::Column(column) => self.column(column),
            Predicate::Literal(value) => self.push(if *value { "TRUE" } else { "FALSE" }),
            Predicate::Not(inner) => {
                self.push("NOT (");
                self.predicate(inner);
                self.push(")");
            }
        }
    }

    fn exists(&mut self, plan: &ConditionalPlan) {
        self.push("EXISTS (SELECT 1 FROM ");
        let from = plan
            .tables
            .iter()
            .map(|table| table.qualified(self.dialect))
            .collect::<Vec<_>>()
            .join(", ");
        self.push(&from);
        self.push(" WHERE ");
        for (idx, predicate) in plan.predicates.iter().enumerate() {
            if idx > 0 {
                self.push(" AND ");
            }
            self.push("(");
            self.predicate(predicate);
            self.push(")");
        }
        self.push(")");
    }
}

fn render_store_query(datastore: String, plans: &[ConditionalPlan]) -> StoreQuery {
    let dialect = plans.first().map(|plan| plan.dialect).unwrap_or_default();
    let mut writer = SqlWriter::new(dialect);
    writer.push("SELECT ");
    for (idx, plan) in plans.iter().enumerate() {
        if idx > 0 {
            writer.push(" OR ");
        }
        writer.exists(plan);
    }

    StoreQuery {
        datastore,
        dialect,
        sql: render(dialect, &writer.parts, &[]),
        binds: writer.binds,
        parts: writer.parts,
    }
}

fn render(dialect: SqlDialect, parts: &[SqlPart], casts: &[Option<String>]) -> String {
    let mut sql = String::new();
    for part in parts {
        match part {
            SqlPart::Text(text) => sql.push_str(text),
            SqlPart::Param { n, .. } => {
                let placeholder = dialect.placeholder(*n);
                match casts.get(n - 1) {
                    Some(Some(ty)) => sql.push_str(&format!("CAST({} AS {})", placeholder, ty)),
                    _ => sql.push_str(&placeholder),
                }
            }
        }
    }
    sql
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}
