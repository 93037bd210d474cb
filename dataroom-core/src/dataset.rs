//! Dataset collaborator contract.
//!
//! The governance core never mutates a dataset. It asks for schema metadata
//! (used by the schema checker and the query builders), for SQL-safe
//! identifier and literal rendering, and for scalar aggregates over a
//! filtered row set. [`InMemoryDataset`] is the reference implementation used
//! by the node binary and the test suites; SQL-backed datasets render
//! [`AggregatePlan::render_sql`] and run it against their own engine.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DatasetId, OrganizationId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DatasetError {
    #[error("column '{0}' not found")]
    UnknownColumn(String),
    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),
    #[error("{function} over '{column}' matched no numeric values")]
    EmptyAggregate { function: String, column: String },
    #[error("row has {actual} values but the dataset declares {expected} columns")]
    RowShape { expected: usize, actual: usize },
    #[error("dataset {0} is not registered")]
    NotFound(DatasetId),
    #[error("dataset engine error: {0}")]
    Engine(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Null,
}

impl CellValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(value) if value.is_finite() => Some(*value),
            _ => None,
        }
    }

    fn compare(&self, other: &CellValue) -> Option<Ordering> {
        match (self, other) {
            (CellValue::Number(a), CellValue::Number(b)) => a.partial_cmp(b),
            (CellValue::Text(a), CellValue::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_owned())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Stddev,
}

impl AggregateFunction {
    pub const ALL: [AggregateFunction; 6] = [
        AggregateFunction::Count,
        AggregateFunction::Sum,
        AggregateFunction::Avg,
        AggregateFunction::Min,
        AggregateFunction::Max,
        AggregateFunction::Stddev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
            AggregateFunction::Stddev => "STDDEV",
        }
    }

    /// Case-insensitive lookup by SQL function name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|function| function.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    LtEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    GtEq,
}

impl ComparisonOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            ComparisonOp::Eq => ordering == Ordering::Equal,
            ComparisonOp::NotEq => ordering != Ordering::Equal,
            ComparisonOp::Lt => ordering == Ordering::Less,
            ComparisonOp::LtEq => ordering != Ordering::Greater,
            ComparisonOp::Gt => ordering == Ordering::Greater,
            ComparisonOp::GtEq => ordering != Ordering::Less,
        }
    }
}

/// One conjunct of a WHERE filter: `<column> <op> <value>`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub column: String,
    pub op: ComparisonOp,
    pub value: CellValue,
}

impl FilterPredicate {
    pub fn new(column: impl Into<String>, op: ComparisonOp, value: impl Into<CellValue>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }
}

/// A single scalar aggregate over a dataset's rows, optionally filtered by a
/// conjunction of predicates. `column == None` means `COUNT(*)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatePlan {
    pub function: AggregateFunction,
    pub column: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterPredicate>,
}

impl AggregatePlan {
    pub fn new(function: AggregateFunction, column: Option<String>) -> Self {
        Self {
            function,
            column,
            filters: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: Vec<FilterPredicate>) -> Self {
        self.filters = filters;
        self
    }

    /// Renders the plan with the dataset's own quoting rules.
    pub fn render_sql(&self, dataset: &dyn Dataset) -> Result<String, DatasetError> {
        let target = match &self.column {
            Some(column) => dataset.sanitize_column(column)?,
            None => "*".to_owned(),
        };
        let mut sql = format!(
            "SELECT {}({}) FROM {}",
            self.function.as_str(),
            target,
            dataset.quoted_table_reference()
        );
        if !self.filters.is_empty() {
            let mut clauses = Vec::with_capacity(self.filters.len());
            for predicate in &self.filters {
                clauses.push(format!(
                    "{} {} {}",
                    dataset.sanitize_column(&predicate.column)?,
                    predicate.op.as_sql(),
                    dataset.sanitize_value(&predicate.value)
                ));
            }
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        Ok(sql)
    }
}

/// Quotes an identifier after checking it only contains `[A-Za-z0-9_]` and
/// does not start with a digit.
pub fn quote_identifier(name: &str) -> Result<String, DatasetError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DatasetError::InvalidIdentifier(name.to_owned()));
    }
    Ok(format!("\"{name}\""))
}

pub fn quote_literal(value: &CellValue) -> String {
    match value {
        CellValue::Number(number) if number.is_finite() => number.to_string(),
        CellValue::Number(_) | CellValue::Null => "NULL".to_owned(),
        CellValue::Text(text) => format!("'{}'", text.replace('\'', "''")),
    }
}

#[async_trait]
pub trait Dataset: Send + Sync {
    fn id(&self) -> &DatasetId;

    fn organization(&self) -> &OrganizationId;

    fn columns(&self) -> Vec<ColumnDef>;

    fn column_type(&self, name: &str) -> Option<String> {
        self.columns()
            .into_iter()
            .find(|column| column.name.eq_ignore_ascii_case(name))
            .map(|column| column.data_type)
    }

    fn has_column(&self, name: &str) -> bool {
        self.column_type(name).is_some()
    }

    fn quoted_table_reference(&self) -> String;

    fn sanitize_column(&self, name: &str) -> Result<String, DatasetError> {
        if !self.has_column(name) {
            return Err(DatasetError::UnknownColumn(name.to_owned()));
        }
        quote_identifier(name)
    }

    fn sanitize_value(&self, value: &CellValue) -> String {
        quote_literal(value)
    }

    async fn aggregate(&self, plan: &AggregatePlan) -> Result<f64, DatasetError>;

    /// Finite numeric values of `column` over the rows matching `filters`,
    /// in row order, non-numeric cells skipped.
    async fn numeric_values(
        &self,
        column: &str,
        filters: &[FilterPredicate],
    ) -> Result<Vec<f64>, DatasetError>;
}

#[derive(Clone, Debug)]
pub struct InMemoryDataset {
    id: DatasetId,
    organization: OrganizationId,
    table: String,
    columns: Vec<ColumnDef>,
    rows: Vec<Vec<CellValue>>,
}

impl InMemoryDataset {
    pub fn new(
        id: impl Into<DatasetId>,
        organization: impl Into<OrganizationId>,
        table: impl Into<String>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            id: id.into(),
            organization: organization.into(),
            table: table.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<CellValue>) -> Result<(), DatasetError> {
        if row.len() != self.columns.len() {
            return Err(DatasetError::RowShape {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn with_rows(mut self, rows: Vec<Vec<CellValue>>) -> Result<Self, DatasetError> {
        for row in rows {
            self.push_row(row)?;
        }
        Ok(self)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn column_index(&self, name: &str) -> Result<usize, DatasetError> {
        self.columns
            .iter()
            .position(|column| column.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DatasetError::UnknownColumn(name.to_owned()))
    }

    fn matching_rows(
        &self,
        filters: &[FilterPredicate],
    ) -> Result<Vec<&Vec<CellValue>>, DatasetError> {
        let resolved = filters
            .iter()
            .map(|predicate| Ok((self.column_index(&predicate.column)?, predicate)))
            .collect::<Result<Vec<_>, DatasetError>>()?;
        Ok(self
            .rows
            .iter()
            .filter(|row| {
                resolved.iter().all(|(index, predicate)| {
                    row[*index]
                        .compare(&predicate.value)
                        .map(|ordering| predicate.op.holds(ordering))
                        .unwrap_or(false)
                })
            })
            .collect())
    }
}

#[async_trait]
impl Dataset for InMemoryDataset {
    fn id(&self) -> &DatasetId {
        &self.id
    }

    fn organization(&self) -> &OrganizationId {
        &self.organization
    }

    fn columns(&self) -> Vec<ColumnDef> {
        self.columns.clone()
    }

    fn quoted_table_reference(&self) -> String {
        format!("\"{}\"", self.table.replace('"', "\"\""))
    }

    async fn aggregate(&self, plan: &AggregatePlan) -> Result<f64, DatasetError> {
        let rows = self.matching_rows(&plan.filters)?;
        let Some(column) = plan.column.as_deref() else {
            return match plan.function {
                AggregateFunction::Count => Ok(rows.len() as f64),
                other => Err(DatasetError::Engine(format!("{other}(*) is not supported"))),
            };
        };
        let index = self.column_index(column)?;
        let values: Vec<f64> = rows.iter().filter_map(|row| row[index].as_number()).collect();
        let empty = || DatasetError::EmptyAggregate {
            function: plan.function.to_string(),
            column: column.to_owned(),
        };
        match plan.function {
            AggregateFunction::Count => Ok(rows
                .iter()
                .filter(|row| !matches!(row[index], CellValue::Null))
                .count() as f64),
            AggregateFunction::Sum => Ok(values.iter().sum()),
            AggregateFunction::Avg => {
                if values.is_empty() {
                    return Err(empty());
                }
                Ok(values.iter().sum::<f64>() / values.len() as f64)
            }
            AggregateFunction::Min => values.iter().copied().reduce(f64::min).ok_or_else(empty),
            AggregateFunction::Max => values.iter().copied().reduce(f64::max).ok_or_else(empty),
            AggregateFunction::Stddev => {
                if values.len() < 2 {
                    return Err(empty());
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let variance =
                    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Ok(variance.sqrt())
            }
        }
    }

    async fn numeric_values(
        &self,
        column: &str,
        filters: &[FilterPredicate],
    ) -> Result<Vec<f64>, DatasetError> {
        let index = self.column_index(column)?;
        Ok(self
            .matching_rows(filters)?
            .into_iter()
            .filter_map(|row| row[index].as_number())
            .collect())
    }
}

/// Lookup table of datasets reachable by the coordinators.
#[derive(Clone, Default)]
pub struct DatasetDirectory {
    datasets: Arc<DashMap<DatasetId, Arc<dyn Dataset>>>,
}

impl DatasetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dataset: Arc<dyn Dataset>) {
        self.datasets.insert(dataset.id().clone(), dataset);
    }

    pub fn get(&self, id: &DatasetId) -> Result<Arc<dyn Dataset>, DatasetError> {
        self.datasets
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| DatasetError::NotFound(id.clone()))
    }

    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}
