use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dataroom_core::{AggregateFunction, Dataset};
use serde_json::json;

use super::dp::ColumnBounds;
use super::{elapsed_ms, BackendExecutor, ExecutionOutcome, ExecutionResult};
use crate::query::Query;

const SCHEME: &str = "BFV";
const POLY_MODULUS_DEGREE: u32 = 8192;

/// Mocked homomorphic-encryption backend.
///
/// Evaluates COUNT and SUM exactly, the way a BFV pipeline would after
/// decryption, and reports the encryption parameters it stands in for. No
/// noise is added and no privacy budget is spent.
#[derive(Clone, Debug, Default)]
pub struct HeExecutor {
    bounds: BTreeMap<String, ColumnBounds>,
}

impl HeExecutor {
    /// `bounds` clip SUM inputs per column before aggregation.
    pub fn new(bounds: BTreeMap<String, ColumnBounds>) -> Self {
        Self { bounds }
    }

    fn bounds_for(&self, column: &str) -> Option<ColumnBounds> {
        self.bounds
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, bounds)| *bounds)
    }
}

#[async_trait]
impl BackendExecutor for HeExecutor {
    async fn execute(
        &self,
        query: &Query,
        dataset: Arc<dyn Dataset>,
        _epsilon: f64,
        _delta: Option<f64>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        let plan = query.plan();
        let (data, metadata) = match (plan.function, plan.column.as_deref()) {
            (AggregateFunction::Count, _) => match dataset.aggregate(plan).await {
                Ok(count) => (
                    json!({ "count": count as u64 }),
                    json!({ "operation": "count", "records_encrypted": count as u64 }),
                ),
                Err(err) => return ExecutionOutcome::Failed(err.to_string()),
            },
            (AggregateFunction::Sum, Some(column)) => {
                let values = match dataset.numeric_values(column, &plan.filters).await {
                    Ok(values) => values,
                    Err(err) => return ExecutionOutcome::Failed(err.to_string()),
                };
                let bounds = self.bounds_for(column);
                let sum: f64 = values
                    .iter()
                    .map(|v| bounds.map_or(*v, |b| b.clamp(*v)))
                    .sum();
                (
                    json!({ "sum": sum }),
                    json!({
                        "operation": "sum",
                        "column": column,
                        "records_encrypted": values.len(),
                        "bounds_applied": bounds.is_some(),
                    }),
                )
            }
            (AggregateFunction::Avg, _) => {
                return ExecutionOutcome::Failed(
                    "AVG is not supported under homomorphic encryption; use SUM and COUNT separately"
                        .into(),
                )
            }
            (function, _) => {
                return ExecutionOutcome::Failed(format!(
                    "{function} is not supported under homomorphic encryption"
                ))
            }
        };
        let mut metadata = metadata;
        metadata["encryption_scheme"] = json!(SCHEME);
        metadata["poly_modulus_degree"] = json!(POLY_MODULUS_DEGREE);
        metadata["mocked"] = json!(true);
        ExecutionOutcome::Completed(ExecutionResult {
            data,
            epsilon_consumed: 0.0,
            delta: None,
            mechanism: "homomorphic_encryption".into(),
            noise_scale: 0.0,
            execution_time_ms: elapsed_ms(started),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::test_query;
    use dataroom_core::{AggregatePlan, CellValue, ColumnDef, InMemoryDataset};

    fn dataset() -> Arc<dyn Dataset> {
        Arc::new(
            InMemoryDataset::new(
                "patients",
                "org-a",
                "patients",
                vec![ColumnDef::new("age", "integer")],
            )
            .with_rows(vec![
                vec![10.0.into()],
                vec![20.0.into()],
                vec![500.0.into()],
                vec![CellValue::Null],
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn counts_non_null_values_exactly() {
        let plan = AggregatePlan::new(AggregateFunction::Count, Some("age".into()));
        let query = test_query("he_backend", plan, 0.0);
        let ExecutionOutcome::Completed(result) =
            HeExecutor::default().execute(&query, dataset(), 0.0, None).await
        else {
            panic!("count should complete");
        };
        assert_eq!(result.data, json!({"count": 3}));
        assert_eq!(result.epsilon_consumed, 0.0);
        assert_eq!(result.mechanism, "homomorphic_encryption");
        assert_eq!(result.metadata["encryption_scheme"], json!("BFV"));
        assert_eq!(result.metadata["poly_modulus_degree"], json!(8192));
    }

    #[tokio::test]
    async fn sum_clips_to_configured_bounds() {
        let bounds = BTreeMap::from([("age".to_owned(), ColumnBounds::new(0.0, 100.0))]);
        let plan = AggregatePlan::new(AggregateFunction::Sum, Some("age".into()));
        let query = test_query("he_backend", plan, 0.0);
        let ExecutionOutcome::Completed(result) =
            HeExecutor::new(bounds).execute(&query, dataset(), 0.0, None).await
        else {
            panic!("sum should complete");
        };
        assert_eq!(result.data, json!({"sum": 130.0}));
        assert_eq!(result.metadata["bounds_applied"], json!(true));
    }

    #[tokio::test]
    async fn avg_is_rejected() {
        let plan = AggregatePlan::new(AggregateFunction::Avg, Some("age".into()));
        let query = test_query("he_backend", plan, 0.0);
        let outcome = HeExecutor::default().execute(&query, dataset(), 0.0, None).await;
        let ExecutionOutcome::Failed(message) = outcome else {
            panic!("avg must fail");
        };
        assert!(message.contains("use SUM and COUNT separately"));
    }
}
