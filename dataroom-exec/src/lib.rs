//! Single-dataset execution of validated queries.
//!
//! A [`Query`] is created by [`QueryExecutionCoordinator::submit`] once the
//! SQL passed the safety validator and the requested backend can evaluate
//! every aggregate it references. Each call to
//! [`QueryExecutionCoordinator::start_run`] produces one immutable [`Run`]:
//! the backend is resolved through the injected [`BackendCatalog`], privacy
//! budget is reserved for epsilon-consuming backends, the executor's tagged
//! [`ExecutionOutcome`] decides between commit and rollback, and the run is
//! persisted and audited before the caller sees it.

pub mod catalog;
pub mod coordinator;
pub mod executor;
pub mod query;
pub mod run;
pub mod store;

pub use catalog::{BackendCatalog, BackendDescriptor, BackendOverride, CatalogError};
pub use coordinator::{ExecuteError, QueryExecutionCoordinator, RunError, SubmitError};
pub use executor::dp::{ColumnBounds, DpConfig, DpExecutor};
pub use executor::he::HeExecutor;
pub use executor::mpc::MpcDispatch;
pub use executor::{BackendExecutor, ExecutionOutcome, ExecutionResult};
pub use query::Query;
pub use run::{Run, RunStateError, RunStatus};
pub use store::{InMemoryRunStore, RunStore, StoreError};
