use std::collections::BTreeSet;
use std::fmt;

use dataroom_core::AggregateFunction;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ast::{
    parse_select, walk_function, FunctionCall, Relation, SelectItem, SelectStatement, SqlError,
    SqlExpr, SubQuery, Visitor,
};

/// Disclosure-rule knobs. Defaults are the production values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ValidatorConfig {
    /// Minimum group size a grouped query must enforce in `HAVING`.
    pub k_anonymity_floor: u64,
    pub minimum_epsilon: f64,
    pub allowed_aggregates: Vec<AggregateFunction>,
    /// Cost of COUNT, MIN and MAX.
    pub low_sensitivity_weight: f64,
    /// Cost of AVG, SUM and STDDEV.
    pub high_sensitivity_weight: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            k_anonymity_floor: 25,
            minimum_epsilon: 0.1,
            allowed_aggregates: AggregateFunction::ALL.to_vec(),
            low_sensitivity_weight: 0.1,
            high_sensitivity_weight: 0.5,
        }
    }
}

impl ValidatorConfig {
    pub fn weight(&self, function: AggregateFunction) -> f64 {
        match function {
            AggregateFunction::Count | AggregateFunction::Min | AggregateFunction::Max => {
                self.low_sensitivity_weight
            }
            AggregateFunction::Avg | AggregateFunction::Sum | AggregateFunction::Stddev => {
                self.high_sensitivity_weight
            }
        }
    }

    fn allows(&self, name: &str) -> Option<AggregateFunction> {
        AggregateFunction::from_name(name)
            .filter(|function| self.allowed_aggregates.contains(function))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Clause {
    TargetList,
    From,
    Where,
    Having,
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Clause::TargetList => "SELECT list",
            Clause::From => "FROM clause",
            Clause::Where => "WHERE clause",
            Clause::Having => "HAVING clause",
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Violation {
    Syntax(SqlError),
    WildcardSelect,
    MissingAggregate { allowed: Vec<AggregateFunction> },
    UngroupedColumns { columns: Vec<String> },
    MissingKAnonymity { floor: u64 },
    Subquery { clause: Clause },
    DisallowedFunction { name: String },
    WindowFunction { name: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::Syntax(err) => write!(f, "{err}"),
            Violation::WildcardSelect => f.write_str(
                "Cannot SELECT * - only aggregate expressions may be returned",
            ),
            Violation::MissingAggregate { allowed } => write!(
                f,
                "Query must contain at least one aggregate function ({})",
                join_names(allowed)
            ),
            Violation::UngroupedColumns { columns } => write!(
                f,
                "Non-aggregate columns ({}) require a GROUP BY clause",
                columns.join(", ")
            ),
            Violation::MissingKAnonymity { floor } => write!(
                f,
                "GROUP BY queries must include HAVING COUNT(*) >= {floor} for k-anonymity"
            ),
            Violation::Subquery { clause } => write!(f, "Subqueries are not allowed in the {clause}"),
            Violation::DisallowedFunction { name } => {
                write!(f, "Function {name} is not an allowed aggregate")
            }
            Violation::WindowFunction { name } => {
                write!(f, "Window functions are not allowed ({name} ... OVER)")
            }
        }
    }
}

fn join_names(functions: &[AggregateFunction]) -> String {
    functions
        .iter()
        .map(AggregateFunction::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outcome of [`SqlSafetyValidator::validate`] in the shape callers persist.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_epsilon: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub errors: Vec<String>,
}

/// A statement that passed every rule, with what downstream components need.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedQuery {
    pub statement: SelectStatement,
    /// Whitelisted aggregate calls of the target list, in order.
    pub aggregates: Vec<(AggregateFunction, FunctionCall)>,
    pub estimated_epsilon: f64,
}

impl ValidatedQuery {
    pub fn aggregate_functions(&self) -> BTreeSet<AggregateFunction> {
        self.aggregates.iter().map(|(function, _)| *function).collect()
    }

    /// First target-list aggregate and its column (`None` for `COUNT(*)`).
    pub fn primary_aggregate(&self) -> Option<(AggregateFunction, Option<String>)> {
        self.aggregates
            .first()
            .map(|(function, call)| (*function, call.column_argument()))
    }

    pub fn table(&self) -> Option<&str> {
        self.statement.primary_table()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SqlSafetyValidator {
    config: ValidatorConfig,
}

impl SqlSafetyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, sql: &str) -> ValidationReport {
        match self.analyze(sql) {
            Ok(validated) => ValidationReport {
                valid: true,
                estimated_epsilon: Some(validated.estimated_epsilon),
                errors: Vec::new(),
            },
            Err(violations) => ValidationReport {
                valid: false,
                estimated_epsilon: None,
                errors: violations.iter().map(ToString::to_string).collect(),
            },
        }
    }

    /// Runs every rule and returns either the accepted statement or all
    /// violations found.
    pub fn analyze(&self, sql: &str) -> Result<ValidatedQuery, Vec<Violation>> {
        let statement = parse_select(sql).map_err(|err| vec![Violation::Syntax(err)])?;
        let mut violations = Vec::new();

        let mut calls = CallCollector::default();
        let mut ungrouped = Vec::new();
        for item in &statement.projection {
            match item {
                SelectItem::Wildcard { .. } => {
                    if !violations.contains(&Violation::WildcardSelect) {
                        violations.push(Violation::WildcardSelect);
                    }
                }
                SelectItem::Expr { expr, .. } => {
                    let before = calls.calls.len();
                    calls.visit_expr(expr);
                    if calls.calls.len() == before {
                        ungrouped.extend(columns_of(expr));
                    }
                }
            }
        }

        let mut aggregates = Vec::new();
        let mut rejected = BTreeSet::new();
        for call in &calls.calls {
            if call.windowed {
                violations.push(Violation::WindowFunction {
                    name: call.name.clone(),
                });
            }
            match self.config.allows(&call.name) {
                Some(function) => aggregates.push((function, call.clone())),
                None => {
                    if rejected.insert(call.name.clone()) {
                        violations.push(Violation::DisallowedFunction {
                            name: call.name.clone(),
                        });
                    }
                }
            }
        }
        if aggregates.is_empty() {
            violations.push(Violation::MissingAggregate {
                allowed: self.config.allowed_aggregates.clone(),
            });
        }

        if !ungrouped.is_empty() && !statement.has_group_by() {
            violations.push(Violation::UngroupedColumns { columns: ungrouped });
        }

        if statement.has_group_by() {
            let floor = self.config.k_anonymity_floor as f64;
            let guarded = statement
                .having
                .as_ref()
                .map(|having| enforces_k_anonymity(having, floor))
                .unwrap_or(false);
            if !guarded {
                violations.push(Violation::MissingKAnonymity {
                    floor: self.config.k_anonymity_floor,
                });
            }
        }

        for clause in nested_query_clauses(&statement) {
            violations.push(Violation::Subquery { clause });
        }

        if !violations.is_empty() {
            debug!(violations = violations.len(), "query rejected by validator");
            return Err(violations);
        }

        let estimated_epsilon = self.estimate_epsilon(aggregates.iter().map(|(f, _)| *f));
        Ok(ValidatedQuery {
            statement,
            aggregates,
            estimated_epsilon,
        })
    }

    fn estimate_epsilon(&self, functions: impl Iterator<Item = AggregateFunction>) -> f64 {
        let total: f64 = functions.map(|function| self.config.weight(function)).sum();
        let rounded = (total * 1e6).round() / 1e6;
        rounded.max(self.config.minimum_epsilon)
    }
}

/// `COUNT(*) >= k` or `COUNT(*) > k` with `k >= floor`, anywhere in an
/// AND/OR tree.
fn enforces_k_anonymity(expr: &SqlExpr, floor: f64) -> bool {
    use crate::ast::BinaryOperator;
    match expr {
        SqlExpr::BoolOp { operands, .. } => operands
            .iter()
            .any(|operand| enforces_k_anonymity(operand, floor)),
        SqlExpr::BinaryOp { left, op, right } => {
            let count_star = matches!(left.as_ref(), SqlExpr::FunctionCall(call) if call.is_count_star());
            count_star
                && matches!(op, BinaryOperator::GtEq | BinaryOperator::Gt)
                && right.as_number().map_or(false, |k| k >= floor)
        }
        _ => false,
    }
}

#[derive(Default)]
struct CallCollector {
    calls: Vec<FunctionCall>,
}

impl Visitor for CallCollector {
    fn visit_function(&mut self, call: &FunctionCall) {
        self.calls.push(call.clone());
        walk_function(self, call);
    }
}

#[derive(Default)]
struct ColumnCollector {
    columns: Vec<String>,
}

impl Visitor for ColumnCollector {
    fn visit_column(&mut self, name: &str) {
        self.columns.push(name.to_owned());
    }
}

fn columns_of(expr: &SqlExpr) -> Vec<String> {
    let mut collector = ColumnCollector::default();
    collector.visit_expr(expr);
    collector.columns
}

#[derive(Default)]
struct SubqueryFinder {
    found: usize,
}

impl Visitor for SubqueryFinder {
    fn visit_subquery(&mut self, _subquery: &SubQuery) {
        self.found += 1;
    }
}

fn contains_subquery(expr: &SqlExpr) -> bool {
    let mut finder = SubqueryFinder::default();
    finder.visit_expr(expr);
    finder.found > 0
}

fn relation_has_subquery(relation: &Relation) -> bool {
    match relation {
        Relation::SubSelect(_) => true,
        Relation::Nested(inner) => inner.iter().any(relation_has_subquery),
        Relation::Table { .. } | Relation::Other(_) => false,
    }
}

fn nested_query_clauses(statement: &SelectStatement) -> Vec<Clause> {
    let mut clauses = Vec::new();
    let in_targets = statement.projection.iter().any(|item| match item {
        SelectItem::Expr { expr, .. } => contains_subquery(expr),
        SelectItem::Wildcard { .. } => false,
    });
    if in_targets {
        clauses.push(Clause::TargetList);
    }
    if !statement.ctes.is_empty() || statement.from.iter().any(relation_has_subquery) {
        clauses.push(Clause::From);
    }
    if statement.selection.as_ref().map_or(false, contains_subquery) {
        clauses.push(Clause::Where);
    }
    if statement.having.as_ref().map_or(false, contains_subquery) {
        clauses.push(Clause::Having);
    }
    clauses
}
