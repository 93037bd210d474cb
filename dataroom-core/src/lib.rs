//! Shared records and collaborator contracts for the DataRoom governance
//! pipeline.
//!
//! Every other workspace crate talks to datasets and to the audit trail
//! through the traits defined here, so the validator, the budget ledger, the
//! backend coordinator and the multi-party engine never depend on a concrete
//! storage layer.

pub mod audit;
pub mod dataset;
pub mod noise;
pub mod types;

pub use audit::{
    emit, AuditAction, AuditEvent, AuditSink, AuditTarget, CompositeAuditSink, MemoryAuditSink,
    NoopAuditSink, TracingAuditSink,
};
pub use dataset::{
    quote_identifier, quote_literal, AggregateFunction, AggregatePlan, CellValue, ColumnDef,
    ComparisonOp, Dataset, DatasetDirectory, DatasetError, FilterPredicate, InMemoryDataset,
};
pub use noise::sample_laplace;
pub use types::{random_id, Actor, DatasetId, OrganizationId};
