use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dataroom_core::Dataset;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::query::Query;

pub mod dp;
pub mod he;
pub mod mpc;

/// What a backend returns for a successful evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub data: Value,
    pub epsilon_consumed: f64,
    pub delta: Option<f64>,
    pub mechanism: String,
    pub noise_scale: f64,
    pub execution_time_ms: u64,
    pub metadata: Value,
}

/// Tagged outcome of [`BackendExecutor::execute`]. Executors report failure
/// through the tag instead of an error channel so the coordinator can tell a
/// missing capability apart from a broken evaluation.
#[derive(Clone, Debug, PartialEq)]
pub enum ExecutionOutcome {
    Completed(ExecutionResult),
    NotImplemented(String),
    Failed(String),
}

#[async_trait]
pub trait BackendExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &Query,
        dataset: Arc<dyn Dataset>,
        epsilon: f64,
        delta: Option<f64>,
    ) -> ExecutionOutcome;
}

/// Wall-clock milliseconds since `start`, at least 1.
pub(crate) fn elapsed_ms(start: Instant) -> u64 {
    (start.elapsed().as_millis() as u64).max(1)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
