use std::sync::Arc;

use async_trait::async_trait;
use dataroom_core::Dataset;

use super::{BackendExecutor, ExecutionOutcome};
use crate::query::Query;

/// Catalog entry for `mpc_backend`. Multi-party computation spans several
/// organizations' datasets and runs through data rooms, so a single-dataset
/// dispatch always reports not-implemented.
#[derive(Clone, Debug, Default)]
pub struct MpcDispatch;

#[async_trait]
impl BackendExecutor for MpcDispatch {
    async fn execute(
        &self,
        query: &Query,
        _dataset: Arc<dyn Dataset>,
        _epsilon: f64,
        _delta: Option<f64>,
    ) -> ExecutionOutcome {
        ExecutionOutcome::NotImplemented(format!(
            "query {} targets a single dataset; multi-party aggregates run through a data room",
            query.id()
        ))
    }
}
