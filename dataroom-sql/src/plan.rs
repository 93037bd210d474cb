//! Turns an accepted statement into the scalar [`AggregatePlan`] executors run.

use dataroom_core::{AggregatePlan, CellValue, ComparisonOp, FilterPredicate};
use thiserror::Error;

use crate::ast::{BinaryOperator, BoolOperator, Literal, SqlExpr};
use crate::validator::ValidatedQuery;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    #[error("query has no aggregate to execute")]
    NoAggregate,
    #[error("WHERE clause must be a conjunction of `column <op> literal` comparisons")]
    UnsupportedFilter,
}

impl ValidatedQuery {
    /// Plan for the first target-list aggregate with the WHERE clause as
    /// filters. Grouping is not part of the plan.
    pub fn aggregate_plan(&self) -> Result<AggregatePlan, PlanError> {
        let (function, column) = self.primary_aggregate().ok_or(PlanError::NoAggregate)?;
        let filters = match &self.statement.selection {
            None => Vec::new(),
            Some(SqlExpr::BoolOp {
                op: BoolOperator::And,
                operands,
            }) => operands
                .iter()
                .map(predicate)
                .collect::<Result<Vec<_>, _>>()?,
            Some(expr) => vec![predicate(expr)?],
        };
        Ok(AggregatePlan::new(function, column).with_filters(filters))
    }
}

fn predicate(expr: &SqlExpr) -> Result<FilterPredicate, PlanError> {
    let SqlExpr::BinaryOp { left, op, right } = expr else {
        return Err(PlanError::UnsupportedFilter);
    };
    let op = comparison(op).ok_or(PlanError::UnsupportedFilter)?;
    match (left.as_ref(), right.as_ref()) {
        (SqlExpr::Column(column), value) => Ok(FilterPredicate::new(
            unqualified(column),
            op,
            cell(value)?,
        )),
        (value, SqlExpr::Column(column)) => Ok(FilterPredicate::new(
            unqualified(column),
            flip(op),
            cell(value)?,
        )),
        _ => Err(PlanError::UnsupportedFilter),
    }
}

fn cell(expr: &SqlExpr) -> Result<CellValue, PlanError> {
    if let Some(number) = expr.as_number() {
        return Ok(CellValue::Number(number));
    }
    match expr {
        SqlExpr::Literal(Literal::String(text)) => Ok(CellValue::Text(text.clone())),
        _ => Err(PlanError::UnsupportedFilter),
    }
}

fn unqualified(column: &str) -> String {
    column.rsplit('.').next().unwrap_or(column).to_owned()
}

fn comparison(op: &BinaryOperator) -> Option<ComparisonOp> {
    Some(match op {
        BinaryOperator::Eq => ComparisonOp::Eq,
        BinaryOperator::NotEq => ComparisonOp::NotEq,
        BinaryOperator::Lt => ComparisonOp::Lt,
        BinaryOperator::LtEq => ComparisonOp::LtEq,
        BinaryOperator::Gt => ComparisonOp::Gt,
        BinaryOperator::GtEq => ComparisonOp::GtEq,
        _ => return None,
    })
}

/// `5 < age` is `age > 5`.
fn flip(op: ComparisonOp) -> ComparisonOp {
    match op {
        ComparisonOp::Lt => ComparisonOp::Gt,
        ComparisonOp::LtEq => ComparisonOp::GtEq,
        ComparisonOp::Gt => ComparisonOp::Lt,
        ComparisonOp::GtEq => ComparisonOp::LtEq,
        other => other,
    }
}
