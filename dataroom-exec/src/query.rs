use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use dataroom_core::{random_id, Actor, AggregateFunction, AggregatePlan, DatasetId};
use serde::Serialize;

/// A validated, immutable request to evaluate one aggregate query.
///
/// Only [`crate::QueryExecutionCoordinator::submit`] builds these, so every
/// instance has passed the SQL safety rules and names a catalogued backend
/// that supports all of its aggregates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Query {
    id: String,
    dataset_id: DatasetId,
    sql: String,
    backend: String,
    plan: AggregatePlan,
    aggregates: BTreeSet<AggregateFunction>,
    estimated_epsilon: f64,
    delta: Option<f64>,
    created_by: Actor,
    created_at: DateTime<Utc>,
}

impl Query {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        dataset_id: DatasetId,
        sql: String,
        backend: String,
        plan: AggregatePlan,
        aggregates: BTreeSet<AggregateFunction>,
        estimated_epsilon: f64,
        delta: Option<f64>,
        created_by: Actor,
    ) -> Self {
        Self {
            id: random_id("qry"),
            dataset_id,
            sql,
            backend,
            plan,
            aggregates,
            estimated_epsilon,
            delta,
            created_by,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dataset_id(&self) -> &DatasetId {
        &self.dataset_id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Scalar aggregate the executors evaluate.
    pub fn plan(&self) -> &AggregatePlan {
        &self.plan
    }

    pub fn aggregates(&self) -> &BTreeSet<AggregateFunction> {
        &self.aggregates
    }

    pub fn estimated_epsilon(&self) -> f64 {
        self.estimated_epsilon
    }

    pub fn delta(&self) -> Option<f64> {
        self.delta
    }

    pub fn created_by(&self) -> &Actor {
        &self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
pub(crate) fn test_query(backend: &str, plan: AggregatePlan, epsilon: f64) -> Query {
    let aggregates = std::iter::once(plan.function).collect();
    Query::new(
        DatasetId::from("patients"),
        "SELECT 1".into(),
        backend.into(),
        plan,
        aggregates,
        epsilon,
        None,
        Actor::from("analyst"),
    )
}
