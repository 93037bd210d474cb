use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dataroom_core::{
    emit, Actor, AuditAction, AuditEvent, AuditSink, AuditTarget, Dataset, DatasetDirectory,
    OrganizationId,
};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::engine::MpcEngine;
use crate::error::{MpcError, RoomError};
use crate::keys::CoordinatorKeyPair;
use crate::participant::{ComputationRequest, LocalComputationParticipant, MaskedValue};
use crate::room::{DataRoom, QueryType, RoomStatus, DEFAULT_ROOM_EPSILON, DEFAULT_ROOM_SENSITIVITY};
use crate::schema::SchemaCompatibilityChecker;

const MIN_PARTIES: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MpcConfig {
    /// Laplace epsilon for new rooms.
    pub epsilon: f64,
    pub sensitivity: f64,
    /// Minimum masking magnitude handed to participants.
    pub masking_floor: f64,
    pub key_bits: usize,
    pub private_key_path: Option<PathBuf>,
}

impl Default for MpcConfig {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_ROOM_EPSILON,
            sensitivity: DEFAULT_ROOM_SENSITIVITY,
            masking_floor: 0.0,
            key_bits: 2048,
            private_key_path: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MpcResult {
    pub room_id: String,
    pub query_type: QueryType,
    pub value: f64,
    pub participants: Vec<OrganizationId>,
    /// Epsilon of the Laplace layer, `None` when no noise was added.
    pub epsilon: Option<f64>,
    pub execution_time_ms: u64,
}

/// Runs data-room computations and records their outcome on the room.
pub struct MpcCoordinator {
    config: MpcConfig,
    engine: Arc<MpcEngine>,
    keys: CoordinatorKeyPair,
    datasets: DatasetDirectory,
    audit: Arc<dyn AuditSink>,
}

impl MpcCoordinator {
    pub fn new(
        config: MpcConfig,
        keys: CoordinatorKeyPair,
        datasets: DatasetDirectory,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            engine: Arc::new(MpcEngine::new()),
            keys,
            datasets,
            audit,
        }
    }

    pub fn with_engine(mut self, engine: MpcEngine) -> Self {
        self.engine = Arc::new(engine);
        self
    }

    pub fn config(&self) -> &MpcConfig {
        &self.config
    }

    pub fn keys(&self) -> &CoordinatorKeyPair {
        &self.keys
    }

    /// New room carrying the configured epsilon and sensitivity.
    pub fn create_room(
        &self,
        name: impl Into<String>,
        query_type: QueryType,
        column: impl Into<String>,
        creator: Actor,
    ) -> DataRoom {
        DataRoom::new(name, query_type, column, creator)
            .with_epsilon(self.config.epsilon)
            .with_sensitivity(self.config.sensitivity)
    }

    /// Records an attestation and audits the room becoming attested.
    pub fn attest(
        &self,
        room: &mut DataRoom,
        organization: &OrganizationId,
        actor: &Actor,
    ) -> Result<bool, RoomError> {
        let attested = room.attest(organization)?;
        if attested {
            self.audit(
                actor,
                AuditAction::DataRoomAttested,
                room,
                json!({
                    "organizations": participant_orgs(room),
                    "query_type": room.query_type,
                }),
            );
        }
        Ok(attested)
    }

    /// Executes the room's aggregate across every participant.
    ///
    /// Precondition and schema failures leave the room untouched. Once
    /// computation starts, any failure marks the room failed.
    pub async fn execute(&self, room: &mut DataRoom, actor: &Actor) -> Result<MpcResult, MpcError> {
        let datasets = match self.preflight(room) {
            Ok(datasets) => datasets,
            Err(err) => {
                warn!(room = room.id(), error = %err, "data room rejected before execution");
                self.audit(
                    actor,
                    AuditAction::DataRoomExecutionFailed,
                    room,
                    json!({ "stage": stage_of(&err), "error": err.to_string() }),
                );
                return Err(err);
            }
        };

        let started = Instant::now();
        room.mark_executing();
        info!(
            room = room.id(),
            participants = datasets.len(),
            query_type = room.query_type.as_str(),
            "data room executing"
        );

        match self.compute(room, datasets, started).await {
            Ok(result) => {
                room.mark_completed(json!(result));
                self.audit(
                    actor,
                    AuditAction::MpcExecuted,
                    room,
                    json!({
                        "organizations": result.participants,
                        "query_type": result.query_type,
                        "epsilon": result.epsilon,
                        "execution_time_ms": result.execution_time_ms,
                    }),
                );
                info!(room = room.id(), elapsed_ms = result.execution_time_ms, "data room completed");
                Ok(result)
            }
            Err(err) => {
                let message = err.to_string();
                room.mark_failed(&message);
                warn!(room = room.id(), error = %message, "data room execution failed");
                self.audit(
                    actor,
                    AuditAction::DataRoomExecutionFailed,
                    room,
                    json!({ "stage": "execution", "error": message }),
                );
                Err(err)
            }
        }
    }

    fn preflight(&self, room: &DataRoom) -> Result<Vec<Arc<dyn Dataset>>, MpcError> {
        let parties = room.participants().len();
        if parties < MIN_PARTIES {
            return Err(MpcError::NotEnoughParties {
                required: MIN_PARTIES,
                actual: parties,
            });
        }
        let declined = room.declined();
        if !declined.is_empty() {
            return Err(MpcError::Declined(declined));
        }
        let unattested = room.unattested();
        if !unattested.is_empty() {
            return Err(MpcError::NotAttested(unattested));
        }
        if room.status() != RoomStatus::Attested {
            return Err(MpcError::InvalidRoomState(room.status()));
        }
        if room.apply_dp_noise {
            for (name, value) in [("epsilon", room.epsilon), ("sensitivity", room.sensitivity)] {
                if !(value > 0.0 && value.is_finite()) {
                    return Err(MpcError::NonPositive { name, value });
                }
            }
        }

        let datasets = room
            .participants()
            .iter()
            .map(|participant| self.datasets.get(&participant.dataset))
            .collect::<Result<Vec<_>, _>>()?;

        let report = SchemaCompatibilityChecker::new(datasets.clone())
            .validate_query_compatibility(&room.column, room.query_type);
        for warning in &report.warnings {
            warn!(room = room.id(), warning = %warning, "schema check");
        }
        if !report.valid {
            return Err(MpcError::Schema(report.errors));
        }
        Ok(datasets)
    }

    async fn compute(
        &self,
        room: &mut DataRoom,
        datasets: Vec<Arc<dyn Dataset>>,
        started: Instant,
    ) -> Result<MpcResult, MpcError> {
        let request = ComputationRequest::for_room(room);
        let workers: Vec<LocalComputationParticipant> = datasets
            .into_iter()
            .map(|dataset| {
                LocalComputationParticipant::new(
                    dataset,
                    Arc::clone(&self.engine),
                    self.keys.public_key().clone(),
                )
                .with_masking_floor(self.config.masking_floor)
            })
            .collect();
        let outcomes = join_all(workers.iter().map(|worker| worker.compute(&request))).await;

        let mut contributions = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (participant, outcome) in room.participants_mut().iter_mut().zip(outcomes) {
            match outcome {
                Ok(contribution) => contributions.push(contribution),
                Err(err) => {
                    participant.mark_failed(err.to_string());
                    failures.push((participant.organization.clone(), err.to_string()));
                }
            }
        }
        if !failures.is_empty() {
            return Err(MpcError::ParticipantsFailed(failures));
        }

        let mut total = self.unmask(contributions.iter().map(|c| &c.value))?;
        if room.query_type == QueryType::Count {
            total = total.round();
        }
        let epsilon = room.apply_dp_noise.then_some(room.epsilon);
        if room.apply_dp_noise {
            total = self.engine.add_noise(total, room.sensitivity, room.epsilon)?;
        }
        let value = match room.query_type {
            QueryType::Sum | QueryType::Count => total,
            QueryType::Avg => {
                let counts = contributions
                    .iter()
                    .map(|c| c.count.as_ref())
                    .collect::<Option<Vec<_>>>()
                    .ok_or(MpcError::EmptyAverage)?;
                let count = self.unmask(counts.into_iter())?.round();
                if count <= 0.0 {
                    return Err(MpcError::EmptyAverage);
                }
                total / count
            }
        };

        for (participant, contribution) in room.participants_mut().iter_mut().zip(&contributions) {
            participant.mark_computed(contribution.metadata());
        }
        Ok(MpcResult {
            room_id: room.id().to_owned(),
            query_type: room.query_type,
            value,
            participants: contributions.iter().map(|c| c.organization.clone()).collect(),
            epsilon,
            execution_time_ms: elapsed_ms(started),
        })
    }

    /// Reconstructs the masked total and strips the decrypted noise.
    fn unmask<'a>(&self, values: impl Iterator<Item = &'a MaskedValue>) -> Result<f64, MpcError> {
        let mut shares = Vec::new();
        let mut noise = 0.0;
        for value in values {
            shares.push(value.share);
            noise += self.keys.decrypt_number(&value.encrypted_noise)?;
        }
        Ok(self.engine.reconstruct(&shares)? - noise)
    }

    fn audit(&self, actor: &Actor, action: AuditAction, room: &DataRoom, mut metadata: Value) {
        metadata["room"] = json!(room.name);
        emit(
            self.audit.as_ref(),
            AuditEvent::new(actor.clone(), action, AuditTarget::new("data_room", room.id()), metadata),
        );
    }
}

fn participant_orgs(room: &DataRoom) -> Vec<OrganizationId> {
    room.participants()
        .iter()
        .map(|participant| participant.organization.clone())
        .collect()
}

fn stage_of(err: &MpcError) -> &'static str {
    match err {
        MpcError::Schema(_) => "schema",
        MpcError::Dataset(_) => "dataset",
        _ => "precondition",
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}
