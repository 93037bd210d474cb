use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::run::Run;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence seam for run records.
pub trait RunStore: Send + Sync {
    fn save(&self, run: &Run) -> Result<(), StoreError>;

    fn get(&self, run_id: &str) -> Option<Run>;

    fn runs_for_query(&self, query_id: &str) -> Vec<Run>;
}

#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<DashMap<String, Run>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

impl RunStore for InMemoryRunStore {
    fn save(&self, run: &Run) -> Result<(), StoreError> {
        self.runs.insert(run.id().to_owned(), run.clone());
        Ok(())
    }

    fn get(&self, run_id: &str) -> Option<Run> {
        self.runs.get(run_id).map(|entry| entry.value().clone())
    }

    fn runs_for_query(&self, query_id: &str) -> Vec<Run> {
        let mut runs: Vec<Run> = self
            .runs
            .iter()
            .filter(|entry| entry.value().query_id() == query_id)
            .map(|entry| entry.value().clone())
            .collect();
        runs.sort_by_key(|run| run.created_at());
        runs
    }
}
