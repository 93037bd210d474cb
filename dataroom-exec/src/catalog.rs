use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use dataroom_core::AggregateFunction;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::executor::dp::{DpConfig, DpExecutor};
use crate::executor::he::HeExecutor;
use crate::executor::mpc::MpcDispatch;
use crate::executor::BackendExecutor;

pub const DP_BACKEND: &str = "dp_backend";
pub const HE_BACKEND: &str = "he_backend";
pub const MPC_BACKEND: &str = "mpc_backend";
pub const ENCLAVE_BACKEND: &str = "enclave_backend";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CatalogError {
    #[error("unknown backend '{0}'")]
    NotFound(String),
    #[error("backend '{backend}' is unavailable; available backends: {}", .alternatives.join(", "))]
    Unavailable {
        backend: String,
        alternatives: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub available: bool,
    pub mocked: bool,
    pub supported_aggregates: BTreeSet<AggregateFunction>,
    pub consumes_epsilon: bool,
    pub notes: String,
}

impl BackendDescriptor {
    pub fn supports(&self, function: AggregateFunction) -> bool {
        self.supported_aggregates.contains(&function)
    }
}

/// Per-backend settings from the node configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendOverride {
    pub available: Option<bool>,
}

struct BackendEntry {
    descriptor: BackendDescriptor,
    executor: Option<Arc<dyn BackendExecutor>>,
}

/// Registry of execution backends, built once at startup and shared.
#[derive(Default)]
pub struct BackendCatalog {
    entries: BTreeMap<String, BackendEntry>,
}

impl fmt::Debug for BackendCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|entry| &entry.descriptor))
            .finish()
    }
}

impl BackendCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four production backends. Only the laplace and HE executors
    /// evaluate single-dataset queries; the enclave has no executor yet.
    pub fn standard(dp: DpConfig) -> Self {
        use AggregateFunction::*;
        let he_bounds = dp.bounds.clone();
        Self::new()
            .with_backend(
                descriptor(
                    DP_BACKEND,
                    true,
                    false,
                    &[Count, Sum, Avg, Min, Max],
                    true,
                    "Laplace mechanism over bounded columns",
                ),
                Some(Arc::new(DpExecutor::new(dp))),
            )
            .with_backend(
                descriptor(
                    HE_BACKEND,
                    true,
                    true,
                    &[Count, Sum],
                    false,
                    "Mocked BFV pipeline; exact COUNT and SUM without noise",
                ),
                Some(Arc::new(HeExecutor::new(he_bounds))),
            )
            .with_backend(
                descriptor(
                    MPC_BACKEND,
                    true,
                    false,
                    &[Count, Sum, Avg],
                    false,
                    "Additive secret sharing across organizations; runs through data rooms",
                ),
                Some(Arc::new(MpcDispatch)),
            )
            .with_backend(
                descriptor(
                    ENCLAVE_BACKEND,
                    false,
                    true,
                    &[Count, Sum, Avg, Min, Max],
                    true,
                    "Hardware enclave execution awaiting attestation support",
                ),
                None,
            )
    }

    pub fn with_backend(
        mut self,
        descriptor: BackendDescriptor,
        executor: Option<Arc<dyn BackendExecutor>>,
    ) -> Self {
        self.entries.insert(
            descriptor.name.clone(),
            BackendEntry {
                descriptor,
                executor,
            },
        );
        self
    }

    /// Applies availability switches; unknown names are logged and skipped.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, BackendOverride>) -> Self {
        for (name, backend) in overrides {
            let Some(entry) = self.entries.get_mut(name) else {
                warn!(backend = %name, "override for unknown backend ignored");
                continue;
            };
            if let Some(available) = backend.available {
                if available && entry.executor.is_none() {
                    warn!(backend = %name, "backend enabled without an executor; it stays unavailable");
                }
                entry.descriptor.available = available;
            }
        }
        self
    }

    pub fn describe(&self, name: &str) -> Result<&BackendDescriptor, CatalogError> {
        self.entries
            .get(name)
            .map(|entry| &entry.descriptor)
            .ok_or_else(|| CatalogError::NotFound(name.to_owned()))
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &BackendDescriptor> {
        self.entries.values().map(|entry| &entry.descriptor)
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|entry| entry.descriptor.available && entry.executor.is_some())
            .unwrap_or(false)
    }

    pub fn available_backends(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter(|name| self.is_available(name))
            .cloned()
            .collect()
    }

    /// Case-insensitive check of an aggregate name against a backend.
    pub fn supports_operation(&self, name: &str, operation: &str) -> bool {
        let Some(function) = AggregateFunction::from_name(operation) else {
            return false;
        };
        self.describe(name)
            .map(|descriptor| descriptor.supports(function))
            .unwrap_or(false)
    }

    /// Looks up an available backend, returning its descriptor with the
    /// executor so callers read capabilities from the same entry.
    pub fn resolve(
        &self,
        name: &str,
    ) -> Result<(&BackendDescriptor, Arc<dyn BackendExecutor>), CatalogError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CatalogError::NotFound(name.to_owned()))?;
        match (&entry.executor, entry.descriptor.available) {
            (Some(executor), true) => Ok((&entry.descriptor, Arc::clone(executor))),
            _ => Err(CatalogError::Unavailable {
                backend: name.to_owned(),
                alternatives: self
                    .available_backends()
                    .into_iter()
                    .filter(|candidate| candidate != name)
                    .collect(),
            }),
        }
    }
}

fn descriptor(
    name: &str,
    available: bool,
    mocked: bool,
    aggregates: &[AggregateFunction],
    consumes_epsilon: bool,
    notes: &str,
) -> BackendDescriptor {
    BackendDescriptor {
        name: name.to_owned(),
        available,
        mocked,
        supported_aggregates: aggregates.iter().copied().collect(),
        consumes_epsilon,
        notes: notes.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_matches_capabilities() {
        let catalog = BackendCatalog::standard(DpConfig::default());
        assert_eq!(
            catalog.available_backends(),
            vec![DP_BACKEND, HE_BACKEND, MPC_BACKEND]
        );
        assert!(catalog.supports_operation(HE_BACKEND, "sum"));
        assert!(!catalog.supports_operation(HE_BACKEND, "Avg"));
        assert!(!catalog.supports_operation(DP_BACKEND, "STDDEV"));
        assert!(catalog.describe(DP_BACKEND).unwrap().consumes_epsilon);
        assert!(!catalog.describe(MPC_BACKEND).unwrap().consumes_epsilon);
        assert!(catalog.describe(ENCLAVE_BACKEND).unwrap().mocked);
    }

    #[test]
    fn unavailable_and_unknown_are_distinct() {
        let catalog = BackendCatalog::standard(DpConfig::default());
        match catalog.resolve(ENCLAVE_BACKEND) {
            Err(CatalogError::Unavailable { alternatives, .. }) => {
                assert_eq!(alternatives, vec![DP_BACKEND, HE_BACKEND, MPC_BACKEND]);
            }
            other => panic!("expected unavailable, got {:?}", other.err()),
        }
        assert_eq!(
            catalog.resolve("quantum_backend").err(),
            Some(CatalogError::NotFound("quantum_backend".into()))
        );
        assert!(catalog.describe("quantum_backend").is_err());
    }

    #[test]
    fn resolve_returns_the_matching_descriptor() {
        let catalog = BackendCatalog::standard(DpConfig::default());
        let (descriptor, _) = catalog.resolve(HE_BACKEND).unwrap();
        assert_eq!(descriptor.name, HE_BACKEND);
        assert!(!descriptor.consumes_epsilon);
        let (descriptor, _) = catalog.resolve(DP_BACKEND).unwrap();
        assert!(descriptor.consumes_epsilon);
    }

    #[test]
    fn overrides_toggle_availability() {
        let overrides = BTreeMap::from([
            (
                HE_BACKEND.to_owned(),
                BackendOverride {
                    available: Some(false),
                },
            ),
            (
                ENCLAVE_BACKEND.to_owned(),
                BackendOverride {
                    available: Some(true),
                },
            ),
        ]);
        let catalog = BackendCatalog::standard(DpConfig::default()).with_overrides(&overrides);
        assert!(!catalog.is_available(HE_BACKEND));
        assert!(!catalog.is_available(ENCLAVE_BACKEND));
        assert!(catalog.describe(ENCLAVE_BACKEND).unwrap().available);
    }
}
