//! Node wiring: datasets, budgets, backends and both coordinators built from
//! one [`Config`].
//!
//! # Example
//! ```no_run
//! use dataroom_node::config::Config;
//! use dataroom_node::service::DataRoomNode;
//!
//! let node = DataRoomNode::from_config(&Config::sample()).unwrap();
//! let report = node.validate_sql("SELECT COUNT(*) FROM visits");
//! assert!(report.valid);
//! ```

use std::sync::Arc;

use dataroom_core::{
    Actor, AuditEvent, AuditSink, CompositeAuditSink, DatasetDirectory, DatasetError, DatasetId,
    FilterPredicate, InMemoryDataset, MemoryAuditSink, TracingAuditSink,
};
use dataroom_exec::{
    BackendCatalog, ExecuteError, InMemoryRunStore, QueryExecutionCoordinator, Run,
};
use dataroom_ledger::{BudgetError, PrivacyBudget, PrivacyBudgetLedger};
use dataroom_mpc::{
    CoordinatorKeyPair, DataRoom, KeyError, MpcConfig, MpcCoordinator, MpcError, MpcResult,
    QueryType, RoomError,
};
use dataroom_sql::{SqlSafetyValidator, ValidationReport};
use thiserror::Error;
use tracing::info;

use crate::config::Config;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("dataset '{id}' could not be loaded: {source}")]
    Dataset {
        id: String,
        #[source]
        source: DatasetError,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Lookup(#[from] DatasetError),
}

/// Parameters for a data room assembled from configured datasets.
#[derive(Clone, Debug, PartialEq)]
pub struct RoomRequest {
    pub name: String,
    pub query_type: QueryType,
    pub column: String,
    pub datasets: Vec<DatasetId>,
    pub filters: Vec<FilterPredicate>,
    pub apply_dp_noise: bool,
}

pub struct DataRoomNode {
    actor: Actor,
    validator: SqlSafetyValidator,
    datasets: DatasetDirectory,
    dataset_ids: Vec<DatasetId>,
    ledger: PrivacyBudgetLedger,
    runs: InMemoryRunStore,
    trail: Arc<MemoryAuditSink>,
    queries: QueryExecutionCoordinator,
    mpc: MpcCoordinator,
}

impl DataRoomNode {
    /// Loads or generates the coordinator key, then assembles the node.
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let keys = load_keys(&config.mpc)?;
        Self::with_keys(config, keys)
    }

    pub fn with_keys(config: &Config, keys: CoordinatorKeyPair) -> Result<Self, ServiceError> {
        let datasets = DatasetDirectory::new();
        let ledger = PrivacyBudgetLedger::new();
        let mut dataset_ids = Vec::with_capacity(config.datasets.len());
        for section in &config.datasets {
            let dataset = InMemoryDataset::new(
                section.id.as_str(),
                section.organization.as_str(),
                section.table_name(),
                section.columns.clone(),
            )
            .with_rows(section.rows.clone())
            .map_err(|source| ServiceError::Dataset {
                id: section.id.clone(),
                source,
            })?;
            let id = DatasetId::new(section.id.clone());
            ledger.register(id.clone(), section.budget);
            datasets.register(Arc::new(dataset));
            dataset_ids.push(id);
        }

        let trail = Arc::new(MemoryAuditSink::new());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![
            Arc::new(TracingAuditSink) as Arc<dyn AuditSink>,
            trail.clone() as Arc<dyn AuditSink>,
        ];
        let audit: Arc<dyn AuditSink> = Arc::new(CompositeAuditSink::new(sinks));

        let validator = SqlSafetyValidator::new(config.validator.clone());
        let catalog =
            Arc::new(BackendCatalog::standard(config.dp.clone()).with_overrides(&config.backends));
        let runs = InMemoryRunStore::new();
        let queries = QueryExecutionCoordinator::new(
            validator.clone(),
            catalog,
            ledger.clone(),
            datasets.clone(),
            Arc::new(runs.clone()),
            audit.clone(),
        );
        let mpc = MpcCoordinator::new(config.mpc.clone(), keys, datasets.clone(), audit);

        info!(
            datasets = dataset_ids.len(),
            backends = ?queries.catalog().available_backends(),
            "node assembled"
        );
        Ok(Self {
            actor: Actor::new(config.node.actor.clone()),
            validator,
            datasets,
            dataset_ids,
            ledger,
            runs,
            trail,
            queries,
            mpc,
        })
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn catalog(&self) -> &BackendCatalog {
        self.queries.catalog()
    }

    pub fn runs(&self) -> &InMemoryRunStore {
        &self.runs
    }

    pub fn validate_sql(&self, sql: &str) -> ValidationReport {
        self.validator.validate(sql)
    }

    pub async fn run_query(
        &self,
        sql: &str,
        dataset: DatasetId,
        backend: &str,
        delta: Option<f64>,
    ) -> Result<Run, ExecuteError> {
        self.queries
            .execute(sql, dataset, backend, delta, &self.actor)
            .await
    }

    /// Creates a room over `request.datasets`, enrolls each dataset's
    /// organization and records every attestation.
    pub fn open_room(&self, request: &RoomRequest) -> Result<DataRoom, ServiceError> {
        let mut room = self
            .mpc
            .create_room(
                request.name.clone(),
                request.query_type,
                request.column.clone(),
                self.actor.clone(),
            )
            .with_filters(request.filters.clone())
            .with_dp_noise(request.apply_dp_noise);
        let mut organizations = Vec::with_capacity(request.datasets.len());
        for id in &request.datasets {
            let dataset = self.datasets.get(id)?;
            let organization = dataset.organization().clone();
            room.add_participant(organization.clone(), id.clone())?;
            organizations.push(organization);
        }
        for organization in &organizations {
            self.mpc.attest(&mut room, organization, &self.actor)?;
        }
        Ok(room)
    }

    pub async fn execute_room(&self, room: &mut DataRoom) -> Result<MpcResult, MpcError> {
        self.mpc.execute(room, &self.actor).await
    }

    pub fn budget(&self, dataset: &DatasetId) -> Result<PrivacyBudget, BudgetError> {
        self.ledger.snapshot(dataset)
    }

    /// Budget snapshots in configuration order.
    pub fn budgets(&self) -> Vec<(DatasetId, PrivacyBudget)> {
        self.dataset_ids
            .iter()
            .filter_map(|id| self.ledger.snapshot(id).ok().map(|budget| (id.clone(), budget)))
            .collect()
    }

    pub fn audit_trail(&self) -> Vec<AuditEvent> {
        self.trail.events()
    }
}

/// Key file, then [`dataroom_mpc::PRIVATE_KEY_ENV`], then a fresh key.
pub fn load_keys(config: &MpcConfig) -> Result<CoordinatorKeyPair, KeyError> {
    if let Some(path) = &config.private_key_path {
        info!(path = %path.display(), "loading coordinator key");
        return CoordinatorKeyPair::from_pem_file(path);
    }
    if let Some(keys) = CoordinatorKeyPair::from_env()? {
        info!(env = dataroom_mpc::PRIVATE_KEY_ENV, "loaded coordinator key from environment");
        return Ok(keys);
    }
    info!(bits = config.key_bits, "generating ephemeral coordinator key");
    CoordinatorKeyPair::generate(config.key_bits)
}
