mod ast;
mod engine;
mod preprocess;
mod translate;

pub use ast::{Expr, ExprTerms, QueryBody, Term, parse_ref};
pub use engine::{EngineError, Evaluation, PolicyEngine};
pub use preprocess::{PreprocessError, RefPreprocessor};
pub use translate::{
    BodyPlan, ConditionalPlan, DATA_ROOT, DatastoreSchema, QueryTranslator, SqlDialect, SqlValue,
    StoreQuery, TableRef, TranslateError, Translation,
};
