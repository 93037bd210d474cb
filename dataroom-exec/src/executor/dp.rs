//! Laplace-mechanism executor for `dp_backend`.
//!
//! COUNT uses sensitivity 1. SUM, MIN and MAX use the width of the column's
//! bounds, taken from configuration or inferred from the selected values,
//! and clamp every value into those bounds first. AVG spends half of epsilon
//! on a noisy sum and half on a noisy count.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dataroom_core::{sample_laplace, AggregateFunction, Dataset, DatasetError};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{elapsed_ms, round_to, BackendExecutor, ExecutionOutcome, ExecutionResult};
use crate::query::Query;

/// Fallback range when a column has no configured bounds and no values.
const EMPTY_RANGE: ColumnBounds = ColumnBounds {
    lower: 0.0,
    upper: 100.0,
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnBounds {
    pub lower: f64,
    pub upper: f64,
}

impl ColumnBounds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn width(&self) -> f64 {
        (self.upper - self.lower).max(0.0)
    }

    pub fn clamp(&self, value: f64) -> f64 {
        value.max(self.lower).min(self.upper)
    }

    fn infer(values: &[f64]) -> Self {
        let lower = values.iter().copied().reduce(f64::min);
        let upper = values.iter().copied().reduce(f64::max);
        match (lower, upper) {
            (Some(lower), Some(upper)) => Self { lower, upper },
            _ => EMPTY_RANGE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DpConfig {
    pub default_delta: f64,
    /// Contribution bounds keyed by column name.
    pub bounds: BTreeMap<String, ColumnBounds>,
}

impl Default for DpConfig {
    fn default() -> Self {
        Self {
            default_delta: 1e-5,
            bounds: BTreeMap::new(),
        }
    }
}

impl DpConfig {
    pub fn bounds_for(&self, column: &str) -> Option<ColumnBounds> {
        self.bounds
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, bounds)| *bounds)
    }
}

pub struct DpExecutor {
    config: DpConfig,
    rng: Mutex<ChaCha20Rng>,
}

impl DpExecutor {
    pub fn new(config: DpConfig) -> Self {
        Self {
            config,
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    /// Deterministic noise for tests and replays.
    pub fn with_seed(config: DpConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    fn noise(&self, scale: f64) -> f64 {
        sample_laplace(&mut *self.rng.lock(), scale)
    }

    async fn evaluate(
        &self,
        query: &Query,
        dataset: &dyn Dataset,
        epsilon: f64,
    ) -> Result<Evaluation, DatasetError> {
        let plan = query.plan();
        let function = plan.function;
        let Some(column) = plan.column.as_deref() else {
            let true_count = dataset.aggregate(plan).await?;
            return Ok(self.count(true_count, epsilon));
        };
        if function == AggregateFunction::Count {
            let true_count = dataset.aggregate(plan).await?;
            let mut evaluation = self.count(true_count, epsilon);
            evaluation.metadata["column"] = json!(column);
            return Ok(evaluation);
        }

        let values = dataset.numeric_values(column, &plan.filters).await?;
        let bounds = self
            .config
            .bounds_for(column)
            .unwrap_or_else(|| ColumnBounds::infer(&values));
        let sensitivity = bounds.width();
        let empty = || DatasetError::EmptyAggregate {
            function: function.to_string(),
            column: column.to_owned(),
        };

        let evaluation = match function {
            AggregateFunction::Sum => {
                let true_sum: f64 = values.iter().map(|v| bounds.clamp(*v)).sum();
                let scale = sensitivity / epsilon;
                let noise = self.noise(scale);
                Evaluation {
                    data: json!({ "sum": round_to(true_sum + noise, 2) }),
                    noise_scale: scale,
                    metadata: json!({
                        "operation": "sum",
                        "column": column,
                        "sensitivity": round_to(sensitivity, 2),
                        "bounds": [bounds.lower, bounds.upper],
                        "true_sum": round_to(true_sum, 2),
                        "noise_added": round_to(noise, 2),
                        "clamped_values": values.len(),
                    }),
                }
            }
            AggregateFunction::Avg => {
                let clamped: Vec<f64> = values.iter().map(|v| bounds.clamp(*v)).collect();
                let count = clamped.len() as f64;
                let true_sum: f64 = clamped.iter().sum();
                let true_avg = if clamped.is_empty() { 0.0 } else { true_sum / count };
                let half = epsilon / 2.0;
                let sum_scale = sensitivity / half;
                let count_scale = 1.0 / half;
                let noisy_sum = true_sum + self.noise(sum_scale);
                let noisy_count = (count + self.noise(count_scale)).max(1.0);
                Evaluation {
                    data: json!({ "average": round_to(noisy_sum / noisy_count, 2) }),
                    noise_scale: sum_scale,
                    metadata: json!({
                        "operation": "avg",
                        "column": column,
                        "sensitivity_sum": round_to(sensitivity, 2),
                        "sensitivity_count": 1.0,
                        "bounds": [bounds.lower, bounds.upper],
                        "true_avg": round_to(true_avg, 2),
                        "true_sum": round_to(true_sum, 2),
                        "true_count": clamped.len(),
                        "noisy_sum": round_to(noisy_sum, 2),
                        "noisy_count": round_to(noisy_count, 2),
                        "epsilon_split": { "sum": half, "count": half },
                    }),
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => {
                let (label, pick): (&str, fn(f64, f64) -> f64) =
                    if function == AggregateFunction::Min {
                        ("min", f64::min)
                    } else {
                        ("max", f64::max)
                    };
                let truth = values.iter().copied().reduce(pick).ok_or_else(empty)?;
                let scale = sensitivity / epsilon;
                let noise = self.noise(scale);
                let mut data = json!({});
                data[label] = json!(round_to(truth + noise, 2));
                let mut metadata = json!({
                    "operation": label,
                    "column": column,
                    "sensitivity": round_to(sensitivity, 2),
                    "bounds": [bounds.lower, bounds.upper],
                    "noise_added": round_to(noise, 2),
                });
                metadata[format!("true_{label}")] = json!(round_to(truth, 2));
                Evaluation {
                    data,
                    noise_scale: scale,
                    metadata,
                }
            }
            AggregateFunction::Count | AggregateFunction::Stddev => {
                return Err(DatasetError::Engine(format!(
                    "{function} is not supported by the laplace executor"
                )));
            }
        };
        Ok(evaluation)
    }

    fn count(&self, true_count: f64, epsilon: f64) -> Evaluation {
        let scale = 1.0 / epsilon;
        let noise = self.noise(scale);
        let noisy = (true_count + noise).max(0.0).round();
        Evaluation {
            data: json!({ "count": noisy as u64 }),
            noise_scale: scale,
            metadata: json!({
                "operation": "count",
                "sensitivity": 1.0,
                "true_count": true_count as u64,
                "noise_added": round_to(noise, 2),
            }),
        }
    }
}

struct Evaluation {
    data: Value,
    noise_scale: f64,
    metadata: Value,
}

#[async_trait]
impl BackendExecutor for DpExecutor {
    async fn execute(
        &self,
        query: &Query,
        dataset: Arc<dyn Dataset>,
        epsilon: f64,
        delta: Option<f64>,
    ) -> ExecutionOutcome {
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return ExecutionOutcome::Failed(format!(
                "laplace mechanism needs a positive epsilon (got {epsilon})"
            ));
        }
        let started = Instant::now();
        match self.evaluate(query, dataset.as_ref(), epsilon).await {
            Ok(evaluation) => {
                debug!(query = query.id(), epsilon, "laplace evaluation finished");
                ExecutionOutcome::Completed(ExecutionResult {
                    data: evaluation.data,
                    epsilon_consumed: epsilon,
                    delta: Some(delta.unwrap_or(self.config.default_delta)),
                    mechanism: "laplace".into(),
                    noise_scale: round_to(evaluation.noise_scale, 3),
                    execution_time_ms: elapsed_ms(started),
                    metadata: evaluation.metadata,
                })
            }
            Err(err) => ExecutionOutcome::Failed(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::test_query;
    use dataroom_core::{AggregatePlan, ColumnDef, InMemoryDataset};

    fn ages(values: &[f64]) -> Arc<dyn Dataset> {
        let dataset = InMemoryDataset::new(
            "patients",
            "org-a",
            "patients",
            vec![ColumnDef::new("age", "integer")],
        )
        .with_rows(values.iter().map(|v| vec![(*v).into()]).collect())
        .unwrap();
        Arc::new(dataset)
    }

    async fn run(
        executor: &DpExecutor,
        plan: AggregatePlan,
        dataset: Arc<dyn Dataset>,
    ) -> ExecutionResult {
        let query = test_query("dp_backend", plan, 1.0);
        match executor.execute(&query, dataset, 1.0, None).await {
            ExecutionOutcome::Completed(result) => result,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn count_is_clamped_rounded_and_annotated() {
        let executor = DpExecutor::with_seed(DpConfig::default(), 42);
        let result = run(
            &executor,
            AggregatePlan::new(AggregateFunction::Count, None),
            ages(&[30.0, 40.0, 50.0]),
        )
        .await;
        let count = result.data["count"].as_u64().unwrap();
        assert!(count < 1_000);
        assert_eq!(result.mechanism, "laplace");
        assert_eq!(result.noise_scale, 1.0);
        assert_eq!(result.delta, Some(1e-5));
        assert_eq!(result.metadata["true_count"], json!(3));
        assert!(result.execution_time_ms >= 1);
    }

    #[tokio::test]
    async fn sum_uses_configured_bounds_for_sensitivity() {
        let mut config = DpConfig::default();
        config.bounds.insert("age".into(), ColumnBounds::new(0.0, 40.0));
        let executor = DpExecutor::with_seed(config, 7);
        let result = run(
            &executor,
            AggregatePlan::new(AggregateFunction::Sum, Some("age".into())),
            ages(&[30.0, 40.0, 90.0]),
        )
        .await;
        assert_eq!(result.metadata["true_sum"], json!(110.0));
        assert_eq!(result.metadata["bounds"], json!([0.0, 40.0]));
        assert_eq!(result.noise_scale, 40.0);
    }

    #[tokio::test]
    async fn avg_splits_epsilon() {
        let executor = DpExecutor::with_seed(DpConfig::default(), 3);
        let result = run(
            &executor,
            AggregatePlan::new(AggregateFunction::Avg, Some("age".into())),
            ages(&[20.0, 30.0, 40.0]),
        )
        .await;
        assert_eq!(result.metadata["epsilon_split"], json!({"sum": 0.5, "count": 0.5}));
        assert_eq!(result.metadata["true_avg"], json!(30.0));
        assert_eq!(result.noise_scale, 40.0);
        assert!(result.metadata["noisy_count"].as_f64().unwrap() >= 1.0);
    }

    #[tokio::test]
    async fn min_without_values_fails() {
        let executor = DpExecutor::with_seed(DpConfig::default(), 1);
        let query = test_query(
            "dp_backend",
            AggregatePlan::new(AggregateFunction::Min, Some("age".into())),
            1.0,
        );
        let outcome = executor.execute(&query, ages(&[]), 1.0, None).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn rejects_non_positive_epsilon() {
        let executor = DpExecutor::new(DpConfig::default());
        let query = test_query(
            "dp_backend",
            AggregatePlan::new(AggregateFunction::Count, None),
            0.0,
        );
        let outcome = executor.execute(&query, ages(&[1.0]), 0.0, None).await;
        assert!(matches!(outcome, ExecutionOutcome::Failed(_)));
    }
}
