use chrono::{DateTime, Utc};
use dataroom_core::{random_id, DatasetId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::ExecutionResult;
use crate::query::Query;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RunStateError {
    #[error("run {run_id} is already {status:?}")]
    Terminal { run_id: String, status: RunStatus },
    #[error("run {run_id} must be running to complete (currently {status:?})")]
    NotRunning { run_id: String, status: RunStatus },
}

/// One execution attempt of a [`Query`]. Never reopened once terminal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    id: String,
    query_id: String,
    dataset_id: DatasetId,
    backend: String,
    status: RunStatus,
    result: Option<Value>,
    epsilon_consumed: f64,
    delta: Option<f64>,
    mechanism: Option<String>,
    noise_scale: Option<f64>,
    execution_time_ms: Option<u64>,
    error_message: Option<String>,
    metadata: Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub(crate) fn pending(query: &Query) -> Self {
        Self {
            id: random_id("run"),
            query_id: query.id().to_owned(),
            dataset_id: query.dataset_id().clone(),
            backend: query.backend().to_owned(),
            status: RunStatus::Pending,
            result: None,
            epsilon_consumed: 0.0,
            delta: None,
            mechanism: None,
            noise_scale: None,
            execution_time_ms: None,
            error_message: None,
            metadata: Value::Null,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn epsilon_consumed(&self) -> f64 {
        self.epsilon_consumed
    }

    pub fn delta(&self) -> Option<f64> {
        self.delta
    }

    pub fn mechanism(&self) -> Option<&str> {
        self.mechanism.as_deref()
    }

    pub fn noise_scale(&self) -> Option<f64> {
        self.noise_scale
    }

    pub fn execution_time_ms(&self) -> Option<u64> {
        self.execution_time_ms
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Mechanism/proof metadata reported by the executor.
    pub fn metadata(&self) -> &Value {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn ensure_open(&self) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            return Err(RunStateError::Terminal {
                run_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), RunStateError> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, result: &ExecutionResult) -> Result<(), RunStateError> {
        self.ensure_open()?;
        if self.status != RunStatus::Running {
            return Err(RunStateError::NotRunning {
                run_id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = RunStatus::Completed;
        self.result = Some(result.data.clone());
        self.epsilon_consumed = result.epsilon_consumed;
        self.delta = result.delta;
        self.mechanism = Some(result.mechanism.clone());
        self.noise_scale = Some(result.noise_scale);
        self.execution_time_ms = Some(result.execution_time_ms);
        self.metadata = result.metadata.clone();
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), RunStateError> {
        self.ensure_open()?;
        let finished = Utc::now();
        if let Some(started) = self.started_at {
            let elapsed = (finished - started).num_milliseconds().max(0);
            self.execution_time_ms = Some(elapsed as u64);
        }
        self.status = RunStatus::Failed;
        self.error_message = Some(message.into());
        self.finished_at = Some(finished);
        Ok(())
    }
}
