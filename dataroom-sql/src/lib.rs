//! SQL safety validation for privacy-governed aggregate queries.
//!
//! Raw SQL is parsed with `sqlparser`, lowered into the typed tree in
//! [`ast`], and checked by [`SqlSafetyValidator`] against the disclosure
//! rules: aggregate-only target lists, mandatory k-anonymity `HAVING`
//! guards on grouped output, no nested queries and a fixed aggregate
//! whitelist. Accepted queries carry an estimated epsilon cost that the
//! budget ledger reserves before execution.

pub mod ast;
pub mod plan;
pub mod validator;

pub use ast::{
    parse_select, BinaryOperator, BoolOperator, FunctionCall, Literal, Relation, SelectItem,
    SelectStatement, SqlError, SqlExpr, SubQuery, Visitor,
};
pub use plan::PlanError;
pub use validator::{
    Clause, SqlSafetyValidator, ValidatedQuery, ValidationReport, ValidatorConfig, Violation,
};
