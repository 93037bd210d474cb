use std::sync::Arc;

use dataroom_core::{
    emit, Actor, AggregateFunction, AuditAction, AuditEvent, AuditSink, AuditTarget,
    DatasetDirectory, DatasetId,
};
use dataroom_ledger::{BudgetError, PrivacyBudgetLedger, Reservation};
use dataroom_sql::{PlanError, SqlSafetyValidator};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{BackendCatalog, CatalogError};
use crate::executor::ExecutionOutcome;
use crate::query::Query;
use crate::run::Run;
use crate::store::RunStore;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubmitError {
    #[error("query rejected: {}", .errors.join("; "))]
    Validation { errors: Vec<String> },
    #[error(transparent)]
    Backend(#[from] CatalogError),
    #[error("backend '{backend}' does not support {}", join_functions(.functions))]
    UnsupportedAggregates {
        backend: String,
        functions: Vec<AggregateFunction>,
    },
    #[error(transparent)]
    Plan(#[from] PlanError),
}

fn join_functions(functions: &[AggregateFunction]) -> String {
    functions
        .iter()
        .map(AggregateFunction::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Execution-stage failure. The run has already been persisted as failed and
/// audited when this is returned.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {} failed: {message}", .run.id())]
    Execution { message: String, run: Box<Run> },
    #[error("backend '{}' is not implemented for this query: {details}", .run.backend())]
    NotImplemented { details: String, run: Box<Run> },
}

impl RunError {
    pub fn run(&self) -> &Run {
        match self {
            RunError::Execution { run, .. } | RunError::NotImplemented { run, .. } => run,
        }
    }

    pub fn into_run(self) -> Run {
        match self {
            RunError::Execution { run, .. } | RunError::NotImplemented { run, .. } => *run,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Run(#[from] RunError),
}

pub struct QueryExecutionCoordinator {
    validator: SqlSafetyValidator,
    catalog: Arc<BackendCatalog>,
    ledger: PrivacyBudgetLedger,
    datasets: DatasetDirectory,
    runs: Arc<dyn RunStore>,
    audit: Arc<dyn AuditSink>,
}

impl QueryExecutionCoordinator {
    pub fn new(
        validator: SqlSafetyValidator,
        catalog: Arc<BackendCatalog>,
        ledger: PrivacyBudgetLedger,
        datasets: DatasetDirectory,
        runs: Arc<dyn RunStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            validator,
            catalog,
            ledger,
            datasets,
            runs,
            audit,
        }
    }

    pub fn catalog(&self) -> &BackendCatalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &PrivacyBudgetLedger {
        &self.ledger
    }

    /// Validates `sql` and checks the backend can evaluate it.
    pub fn submit(
        &self,
        sql: &str,
        dataset_id: DatasetId,
        backend: &str,
        delta: Option<f64>,
        actor: &Actor,
    ) -> Result<Query, SubmitError> {
        let target = AuditTarget::new("dataset", dataset_id.as_str());
        let validated = match self.validator.analyze(sql) {
            Ok(validated) => validated,
            Err(violations) => {
                let errors: Vec<String> = violations.iter().map(ToString::to_string).collect();
                self.audit(
                    actor,
                    AuditAction::QueryFailed,
                    target,
                    json!({ "stage": "validation", "backend": backend, "errors": errors }),
                );
                return Err(SubmitError::Validation { errors });
            }
        };

        let checked = self.check_backend(backend, validated.aggregate_functions().into_iter());
        let plan = checked.and_then(|()| validated.aggregate_plan().map_err(SubmitError::from));
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                self.audit(
                    actor,
                    AuditAction::QueryFailed,
                    target,
                    json!({ "stage": "submission", "backend": backend, "error": err.to_string() }),
                );
                return Err(err);
            }
        };

        let query = Query::new(
            dataset_id,
            sql.to_owned(),
            backend.to_owned(),
            plan,
            validated.aggregate_functions(),
            validated.estimated_epsilon,
            delta,
            actor.clone(),
        );
        self.audit(
            actor,
            AuditAction::QueryCreated,
            AuditTarget::new("query", query.id()),
            json!({
                "dataset": query.dataset_id(),
                "backend": backend,
                "estimated_epsilon": query.estimated_epsilon(),
            }),
        );
        info!(query = query.id(), backend, epsilon = query.estimated_epsilon(), "query submitted");
        Ok(query)
    }

    fn check_backend(
        &self,
        backend: &str,
        functions: impl Iterator<Item = AggregateFunction>,
    ) -> Result<(), SubmitError> {
        let descriptor = self.catalog.describe(backend)?;
        let missing: Vec<AggregateFunction> =
            functions.filter(|function| !descriptor.supports(*function)).collect();
        if !missing.is_empty() {
            return Err(SubmitError::UnsupportedAggregates {
                backend: backend.to_owned(),
                functions: missing,
            });
        }
        Ok(())
    }

    /// Executes one attempt of `query`.
    ///
    /// Resource problems (backend, dataset, budget) come back as `Ok` with a
    /// failed run; executor failures come back as [`RunError`]. Either way
    /// the run is persisted and audited first.
    pub async fn start_run(&self, query: &Query, actor: &Actor) -> Result<Run, RunError> {
        let mut run = Run::pending(query);
        self.persist(&run);

        let (executor, consumes_epsilon) = match self.catalog.resolve(query.backend()) {
            Ok((descriptor, executor)) => (executor, descriptor.consumes_epsilon),
            Err(err) => {
                let alternatives = match &err {
                    CatalogError::Unavailable { alternatives, .. } => alternatives.clone(),
                    CatalogError::NotFound(_) => self.catalog.available_backends(),
                };
                return Ok(self.reject(
                    run,
                    actor,
                    AuditAction::BackendUnavailable,
                    err.to_string(),
                    json!({ "backend": query.backend(), "alternatives": alternatives }),
                ));
            }
        };

        let dataset = match self.datasets.get(query.dataset_id()) {
            Ok(dataset) => dataset,
            Err(err) => {
                return Ok(self.reject(
                    run,
                    actor,
                    AuditAction::QueryFailed,
                    err.to_string(),
                    json!({ "stage": "dataset", "dataset": query.dataset_id() }),
                ));
            }
        };

        let epsilon = query.estimated_epsilon();
        let reservation = if consumes_epsilon {
            match self.ledger.reserve(query.dataset_id(), epsilon) {
                Ok(reservation) => Some(reservation),
                Err(err) => {
                    let action = match err {
                        BudgetError::Exhausted { .. } => AuditAction::PrivacyBudgetExhausted,
                        BudgetError::Missing(_) | BudgetError::InvalidEpsilon(_) => {
                            AuditAction::QueryFailed
                        }
                    };
                    return Ok(self.reject(
                        run,
                        actor,
                        action,
                        err.to_string(),
                        json!({ "stage": "budget", "dataset": query.dataset_id(), "requested": epsilon }),
                    ));
                }
            }
        } else {
            None
        };

        self.transition(&mut run, Run::start);
        self.persist(&run);
        info!(run = run.id(), query = query.id(), backend = query.backend(), "run started");

        // No lock is held here: the reservation is the only claim on the budget.
        let outcome = executor
            .execute(query, dataset, epsilon, query.delta())
            .await;

        match outcome {
            ExecutionOutcome::Completed(result) => {
                if let Some(reservation) = &reservation {
                    self.settle(reservation, result.epsilon_consumed);
                }
                self.transition(&mut run, |run| run.complete(&result));
                self.persist(&run);
                self.audit(
                    actor,
                    AuditAction::QueryExecuted,
                    AuditTarget::new("run", run.id()),
                    json!({
                        "query": query.id(),
                        "backend": query.backend(),
                        "mechanism": result.mechanism,
                        "epsilon_consumed": result.epsilon_consumed,
                        "execution_time_ms": result.execution_time_ms,
                    }),
                );
                info!(run = run.id(), epsilon = result.epsilon_consumed, "run completed");
                Ok(run)
            }
            ExecutionOutcome::Failed(message) => {
                self.release(reservation.as_ref());
                let run = self.reject(
                    run,
                    actor,
                    AuditAction::QueryFailed,
                    message.clone(),
                    json!({ "stage": "execution", "backend": query.backend() }),
                );
                Err(RunError::Execution {
                    message,
                    run: Box::new(run),
                })
            }
            ExecutionOutcome::NotImplemented(details) => {
                self.release(reservation.as_ref());
                let run = self.reject(
                    run,
                    actor,
                    AuditAction::BackendNotImplemented,
                    format!("backend {} not implemented: {details}", query.backend()),
                    json!({ "backend": query.backend(), "details": details }),
                );
                Err(RunError::NotImplemented {
                    details,
                    run: Box::new(run),
                })
            }
        }
    }

    /// Validates, submits and runs in one call.
    pub async fn execute(
        &self,
        sql: &str,
        dataset_id: DatasetId,
        backend: &str,
        delta: Option<f64>,
        actor: &Actor,
    ) -> Result<Run, ExecuteError> {
        let query = self.submit(sql, dataset_id, backend, delta, actor)?;
        Ok(self.start_run(&query, actor).await?)
    }

    /// Commits what the backend actually spent and releases the rest.
    fn settle(&self, reservation: &Reservation, actual: f64) {
        let actual = actual.clamp(0.0, reservation.epsilon);
        if let Err(err) = self.ledger.commit(&reservation.dataset, actual) {
            warn!(reservation = %reservation.id, error = %err, "failed to commit privacy budget");
        }
        let unused = reservation.epsilon - actual;
        if unused > 0.0 {
            if let Err(err) = self.ledger.rollback(&reservation.dataset, unused) {
                warn!(reservation = %reservation.id, error = %err, "failed to release unused budget");
            }
        }
    }

    fn release(&self, reservation: Option<&Reservation>) {
        let Some(reservation) = reservation else {
            return;
        };
        if let Err(err) = self.ledger.rollback(&reservation.dataset, reservation.epsilon) {
            warn!(reservation = %reservation.id, error = %err, "failed to roll back privacy budget");
        }
    }

    fn reject(
        &self,
        mut run: Run,
        actor: &Actor,
        action: AuditAction,
        message: String,
        mut metadata: Value,
    ) -> Run {
        warn!(run = run.id(), action = action.as_str(), error = %message, "run failed");
        self.transition(&mut run, |run| run.fail(message.clone()));
        self.persist(&run);
        metadata["query"] = json!(run.query_id());
        metadata["error"] = json!(message);
        self.audit(actor, action, AuditTarget::new("run", run.id()), metadata);
        run
    }

    fn transition<F>(&self, run: &mut Run, step: F)
    where
        F: FnOnce(&mut Run) -> Result<(), crate::run::RunStateError>,
    {
        if let Err(err) = step(run) {
            warn!(run = run.id(), error = %err, "illegal run transition ignored");
        }
    }

    fn persist(&self, run: &Run) {
        if let Err(err) = self.runs.save(run) {
            warn!(run = run.id(), error = %err, "failed to persist run");
        }
    }

    fn audit(&self, actor: &Actor, action: AuditAction, target: AuditTarget, metadata: Value) {
        emit(
            self.audit.as_ref(),
            AuditEvent::new(actor.clone(), action, target, metadata),
        );
    }
}
