//! Per-organization step of an MPC run.

use std::sync::Arc;
use std::time::Instant;

use dataroom_core::{AggregateFunction, AggregatePlan, Dataset, FilterPredicate, OrganizationId};
use rsa::RsaPublicKey;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::engine::MpcEngine;
use crate::error::MpcError;
use crate::keys::encrypt_number;
use crate::room::{DataRoom, QueryType};

/// What every participant is asked to evaluate, detached from the room so
/// participants can run concurrently while the room stays borrowed mutably.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ComputationRequest {
    pub room_id: String,
    pub query_type: QueryType,
    pub column: String,
    pub filters: Vec<FilterPredicate>,
}

impl ComputationRequest {
    pub fn for_room(room: &DataRoom) -> Self {
        Self {
            room_id: room.id().to_owned(),
            query_type: room.query_type,
            column: room.column.clone(),
            filters: room.filters.clone(),
        }
    }
}

/// A local aggregate plus the noise it was masked with, encrypted for the
/// coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedValue {
    pub share: f64,
    pub encrypted_noise: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalContribution {
    pub organization: OrganizationId,
    pub value: MaskedValue,
    /// Present for AVG rooms.
    pub count: Option<MaskedValue>,
    pub sql: Vec<String>,
    pub elapsed_ms: u64,
}

impl LocalContribution {
    /// Proof metadata stored on the participant record.
    pub fn metadata(&self) -> Value {
        let mut metadata = json!({
            "masked_share": self.value.share,
            "encrypted_noise": hex::encode(&self.value.encrypted_noise),
            "sql": self.sql,
            "computation_time_ms": self.elapsed_ms,
        });
        if let Some(count) = &self.count {
            metadata["masked_count"] = json!(count.share);
            metadata["encrypted_count_noise"] = json!(hex::encode(&count.encrypted_noise));
        }
        metadata
    }
}

pub struct LocalComputationParticipant {
    dataset: Arc<dyn Dataset>,
    engine: Arc<MpcEngine>,
    coordinator_key: RsaPublicKey,
    masking_floor: f64,
}

impl LocalComputationParticipant {
    pub fn new(dataset: Arc<dyn Dataset>, engine: Arc<MpcEngine>, coordinator_key: RsaPublicKey) -> Self {
        Self {
            dataset,
            engine,
            coordinator_key,
            masking_floor: 0.0,
        }
    }

    /// Lower bound on the masking magnitude; small or zero local values are
    /// otherwise masked by little or nothing.
    pub fn with_masking_floor(mut self, floor: f64) -> Self {
        self.masking_floor = floor.max(0.0);
        self
    }

    pub fn organization(&self) -> &OrganizationId {
        self.dataset.organization()
    }

    pub async fn compute(&self, request: &ComputationRequest) -> Result<LocalContribution, MpcError> {
        let started = Instant::now();
        let mut sql = Vec::new();

        let primary = request.query_type.local_aggregate();
        let (local, statement) = self.evaluate(primary, request).await?;
        sql.push(statement);
        let value = self.mask(local)?;

        let count = if request.query_type == QueryType::Avg {
            let (local_count, statement) = self.evaluate(AggregateFunction::Count, request).await?;
            sql.push(statement);
            Some(self.mask(local_count)?)
        } else {
            None
        };

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            room = %request.room_id,
            organization = %self.organization(),
            elapsed_ms,
            "local contribution ready"
        );
        Ok(LocalContribution {
            organization: self.organization().clone(),
            value,
            count,
            sql,
            elapsed_ms,
        })
    }

    async fn evaluate(
        &self,
        function: AggregateFunction,
        request: &ComputationRequest,
    ) -> Result<(f64, String), MpcError> {
        let plan = AggregatePlan::new(function, Some(request.column.clone()))
            .with_filters(request.filters.clone());
        let statement = plan.render_sql(self.dataset.as_ref())?;
        let value = self.dataset.aggregate(&plan).await?;
        Ok((value, statement))
    }

    fn mask(&self, local: f64) -> Result<MaskedValue, MpcError> {
        let magnitude = (2.0 * local.abs()).max(self.masking_floor);
        let noise = self.engine.generate_masking_noise(magnitude);
        Ok(MaskedValue {
            share: local + noise,
            encrypted_noise: encrypt_number(&self.coordinator_key, noise)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::tests::test_keys;
    use dataroom_core::{Actor, ColumnDef, ComparisonOp, InMemoryDataset};

    fn dataset() -> Arc<dyn Dataset> {
        Arc::new(
            InMemoryDataset::new(
                "sales-a",
                "org-a",
                "sales",
                vec![ColumnDef::new("revenue", "integer"), ColumnDef::new("region", "text")],
            )
            .with_rows(vec![
                vec![40.0.into(), "west".into()],
                vec![60.0.into(), "east".into()],
                vec![25.0.into(), "west".into()],
            ])
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn masked_share_hides_local_sum() {
        let keys = test_keys();
        let participant =
            LocalComputationParticipant::new(dataset(), Arc::new(MpcEngine::with_seed(1)), keys.public_key().clone());
        let room = DataRoom::new("r", QueryType::Sum, "revenue", Actor::system()).with_filters(vec![
            FilterPredicate::new("region", ComparisonOp::Eq, "west"),
        ]);
        let contribution = participant
            .compute(&ComputationRequest::for_room(&room))
            .await
            .unwrap();

        let noise = keys.decrypt_number(&contribution.value.encrypted_noise).unwrap();
        assert!(noise.abs() <= 130.0);
        assert!((contribution.value.share - noise - 65.0).abs() < 1e-9);
        assert!(contribution.count.is_none());
        assert_eq!(
            contribution.sql,
            vec![r#"SELECT SUM("revenue") FROM "sales" WHERE "region" = 'west'"#.to_owned()]
        );
        let metadata = contribution.metadata();
        assert_eq!(metadata["sql"][0], json!(contribution.sql[0]));
        assert!(metadata.get("masked_count").is_none());
    }

    #[tokio::test]
    async fn avg_gathers_count_in_the_same_pass() {
        let keys = test_keys();
        let participant =
            LocalComputationParticipant::new(dataset(), Arc::new(MpcEngine::with_seed(2)), keys.public_key().clone());
        let room = DataRoom::new("r", QueryType::Avg, "revenue", Actor::system());
        let contribution = participant
            .compute(&ComputationRequest::for_room(&room))
            .await
            .unwrap();
        let count = contribution.count.expect("avg carries a count");
        let count_noise = keys.decrypt_number(&count.encrypted_noise).unwrap();
        assert!((count.share - count_noise - 3.0).abs() < 1e-9);
        assert_eq!(contribution.sql.len(), 2);
        assert!(contribution.sql[1].starts_with("SELECT COUNT"));
    }

    #[tokio::test]
    async fn floor_masks_zero_totals() {
        let keys = test_keys();
        let participant =
            LocalComputationParticipant::new(dataset(), Arc::new(MpcEngine::with_seed(3)), keys.public_key().clone())
                .with_masking_floor(50.0);
        let room = DataRoom::new("r", QueryType::Count, "revenue", Actor::system()).with_filters(vec![
            FilterPredicate::new("region", ComparisonOp::Eq, "north"),
        ]);
        let contribution = participant
            .compute(&ComputationRequest::for_room(&room))
            .await
            .unwrap();
        let noise = keys.decrypt_number(&contribution.value.encrypted_noise).unwrap();
        assert_ne!(noise, 0.0);
        assert_eq!(contribution.value.share, noise);
    }

    #[tokio::test]
    async fn unknown_column_is_reported() {
        let keys = test_keys();
        let participant =
            LocalComputationParticipant::new(dataset(), Arc::new(MpcEngine::with_seed(4)), keys.public_key().clone());
        let room = DataRoom::new("r", QueryType::Sum, "profit", Actor::system());
        let err = participant
            .compute(&ComputationRequest::for_room(&room))
            .await
            .unwrap_err();
        assert!(matches!(err, MpcError::Dataset(_)));
    }
}
