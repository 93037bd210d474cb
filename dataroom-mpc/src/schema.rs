//! Cross-dataset schema checks run before an MPC computation starts.

use std::collections::BTreeMap;
use std::sync::Arc;

use dataroom_core::{Dataset, DatasetId};
use serde::{Deserialize, Serialize};

use crate::room::QueryType;

const NUMERIC_TYPES: &[&str] = &[
    "integer", "int", "bigint", "smallint", "float", "double", "decimal", "real", "numeric",
];
const STRING_TYPES: &[&str] = &["string", "text", "varchar", "char"];
const DEFAULT_MAX_DISTANCE: usize = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Checks that every participating dataset can answer the same aggregate.
#[derive(Clone)]
pub struct SchemaCompatibilityChecker {
    datasets: Vec<Arc<dyn Dataset>>,
    max_distance: usize,
}

impl std::fmt::Debug for SchemaCompatibilityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCompatibilityChecker")
            .field("datasets", &self.datasets.iter().map(|d| d.id()).collect::<Vec<_>>())
            .field("max_distance", &self.max_distance)
            .finish()
    }
}

impl SchemaCompatibilityChecker {
    pub fn new(datasets: Vec<Arc<dyn Dataset>>) -> Self {
        Self {
            datasets,
            max_distance: DEFAULT_MAX_DISTANCE,
        }
    }

    pub fn with_max_distance(mut self, max_distance: usize) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub fn column_exists_in_all(&self, column: &str) -> bool {
        self.datasets.iter().all(|dataset| dataset.has_column(column))
    }

    /// Datasets that lack `column`.
    pub fn find_missing(&self, column: &str) -> Vec<DatasetId> {
        self.datasets
            .iter()
            .filter(|dataset| !dataset.has_column(column))
            .map(|dataset| dataset.id().clone())
            .collect()
    }

    /// True when `column` has the same type everywhere, or every type falls
    /// in the same numeric or string family. Missing columns are ignored.
    pub fn compatible_types(&self, column: &str) -> bool {
        let types = self.types_of(column);
        let mut normalized = types.values().map(|ty| normalize(ty));
        let Some(first) = normalized.next() else {
            return true;
        };
        let rest: Vec<String> = normalized.collect();
        if rest.iter().all(|ty| *ty == first) {
            return true;
        }
        let all = || std::iter::once(first.as_str()).chain(rest.iter().map(String::as_str));
        all().all(is_numeric) || all().all(is_string)
    }

    /// Per dataset, its columns within edit distance of `column`, closest
    /// first. A dataset that has `column` lists it at distance zero.
    pub fn suggest_alternatives(&self, column: &str) -> BTreeMap<DatasetId, Vec<String>> {
        let needle = column.to_ascii_lowercase();
        self.datasets
            .iter()
            .map(|dataset| {
                let mut candidates: Vec<(usize, String)> = dataset
                    .columns()
                    .into_iter()
                    .filter_map(|def| {
                        levenshtein_within(&def.name.to_ascii_lowercase(), &needle, self.max_distance)
                            .map(|distance| (distance, def.name))
                    })
                    .collect();
                candidates.sort();
                (
                    dataset.id().clone(),
                    candidates.into_iter().map(|(_, name)| name).collect(),
                )
            })
            .collect()
    }

    pub fn validate_query_compatibility(&self, column: &str, query_type: QueryType) -> CompatibilityReport {
        let mut report = CompatibilityReport::default();

        let missing = self.find_missing(column);
        if !missing.is_empty() {
            report.errors.push(format!(
                "column '{column}' is missing from: {}",
                join_ids(&missing)
            ));
            for (dataset, suggestions) in self.suggest_alternatives(column) {
                if missing.contains(&dataset) && !suggestions.is_empty() {
                    report.warnings.push(format!(
                        "dataset {dataset}: did you mean {}?",
                        suggestions.join(", ")
                    ));
                }
            }
        }

        let types = self.types_of(column);
        if !self.compatible_types(column) {
            let mut groups: BTreeMap<String, Vec<DatasetId>> = BTreeMap::new();
            for (dataset, ty) in &types {
                groups.entry(normalize(ty)).or_default().push(dataset.clone());
            }
            let described = groups
                .iter()
                .map(|(ty, datasets)| format!("{ty} ({})", join_ids(datasets)))
                .collect::<Vec<_>>()
                .join(", ");
            report
                .errors
                .push(format!("column '{column}' has incompatible types: {described}"));
        }

        if matches!(query_type, QueryType::Sum | QueryType::Avg) {
            let non_numeric: Vec<DatasetId> = types
                .iter()
                .filter(|(_, ty)| !is_numeric(&normalize(ty)))
                .map(|(dataset, _)| dataset.clone())
                .collect();
            if !non_numeric.is_empty() {
                report.errors.push(format!(
                    "{query_type} requires a numeric column; '{column}' is not numeric in: {}",
                    join_ids(&non_numeric)
                ));
            }
        }

        report.valid = report.errors.is_empty();
        report
    }

    fn types_of(&self, column: &str) -> BTreeMap<DatasetId, String> {
        self.datasets
            .iter()
            .filter_map(|dataset| {
                dataset
                    .column_type(column)
                    .map(|ty| (dataset.id().clone(), ty))
            })
            .collect()
    }
}

fn normalize(ty: &str) -> String {
    let lower = ty.trim().to_ascii_lowercase();
    // varchar(255), decimal(10,2)
    match lower.split_once('(') {
        Some((base, _)) => base.trim().to_owned(),
        None => lower,
    }
}

fn is_numeric(ty: &str) -> bool {
    NUMERIC_TYPES.contains(&ty)
}

fn is_string(ty: &str) -> bool {
    STRING_TYPES.contains(&ty)
}

fn join_ids(ids: &[DatasetId]) -> String {
    ids.iter().map(DatasetId::as_str).collect::<Vec<_>>().join(", ")
}

/// Edit distance between `value` and `needle` if it is at most `max`.
fn levenshtein_within(value: &str, needle: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = value.chars().collect();
    let b: Vec<char> = needle.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        let mut row_min = cur[0];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
            row_min = row_min.min(cur[j + 1]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    let distance = prev[b.len()];
    (distance <= max).then_some(distance)
}
