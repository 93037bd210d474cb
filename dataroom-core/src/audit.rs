use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::types::Actor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    QueryCreated,
    QueryExecuted,
    QueryFailed,
    PrivacyBudgetExhausted,
    BackendUnavailable,
    BackendNotImplemented,
    MpcExecuted,
    DataRoomAttested,
    DataRoomExecutionFailed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::QueryCreated => "query_created",
            AuditAction::QueryExecuted => "query_executed",
            AuditAction::QueryFailed => "query_failed",
            AuditAction::PrivacyBudgetExhausted => "privacy_budget_exhausted",
            AuditAction::BackendUnavailable => "backend_unavailable",
            AuditAction::BackendNotImplemented => "backend_not_implemented",
            AuditAction::MpcExecuted => "mpc_executed",
            AuditAction::DataRoomAttested => "data_room_attested",
            AuditAction::DataRoomExecutionFailed => "data_room_execution_failed",
        }
    }
}

/// The record an audit entry is about, e.g. `run:run-0af3…`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub kind: String,
    pub id: String,
}

impl AuditTarget {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: DateTime<Utc>,
    pub actor: Actor,
    pub action: AuditAction,
    pub target: AuditTarget,
    pub metadata: Value,
}

impl AuditEvent {
    pub fn new(actor: Actor, action: AuditAction, target: AuditTarget, metadata: Value) -> Self {
        Self {
            ts: Utc::now(),
            actor,
            action,
            target,
            metadata,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn log(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Fire-and-forget delivery: a failing sink is logged and otherwise ignored
/// so it never changes the outcome of the operation being audited.
pub fn emit(sink: &dyn AuditSink, event: AuditEvent) {
    let action = event.action;
    if let Err(err) = sink.log(event) {
        warn!(action = action.as_str(), error = %err, "audit sink rejected event");
    }
}

/// No-op audit sink (useful for demos and tests that do not inspect events).
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn log(&self, _event: AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps every event in memory; tests assert on the recorded actions.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events.lock().iter().map(|event| event.action).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, event: AuditEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Writes audit events into the structured log stream.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, event: AuditEvent) -> anyhow::Result<()> {
        let metadata = serde_json::to_string(&event.metadata)?;
        info!(
            target: "dataroom::audit",
            actor = %event.actor,
            action = event.action.as_str(),
            target_kind = %event.target.kind,
            target_id = %event.target.id,
            %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Fan-out sink for emitting to multiple audit backends.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for CompositeAuditSink {
    fn log(&self, event: AuditEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.log(event.clone())?;
        }
        Ok(())
    }
}
