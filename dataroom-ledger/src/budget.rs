use std::sync::Arc;

use dashmap::DashMap;
use dataroom_core::{random_id, DatasetId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Slack for f64 drift in budget arithmetic, e.g. `0.3 - 0.1 - 0.1 < 0.1`.
const FIT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BudgetError {
    #[error("no privacy budget registered for dataset {0}")]
    Missing(DatasetId),
    #[error("epsilon must be a finite, non-negative number (got {0})")]
    InvalidEpsilon(f64),
    #[error(
        "privacy budget exhausted for dataset {dataset}: requested {requested}, \
         remaining {remaining} (consumed {consumed}, reserved {reserved})"
    )]
    Exhausted {
        dataset: DatasetId,
        consumed: f64,
        reserved: f64,
        remaining: f64,
        requested: f64,
    },
}

/// Counters for one dataset. `consumed + reserved <= total` always holds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyBudget {
    pub total: f64,
    pub consumed: f64,
    pub reserved: f64,
}

impl PrivacyBudget {
    pub fn new(total: f64) -> Self {
        Self {
            total: total.max(0.0),
            consumed: 0.0,
            reserved: 0.0,
        }
    }

    pub fn remaining(&self) -> f64 {
        let left = self.total - self.consumed - self.reserved;
        if left <= FIT_TOLERANCE {
            0.0
        } else {
            left
        }
    }
}

/// Handle returned by a successful reservation, used for log correlation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub dataset: DatasetId,
    pub epsilon: f64,
}

#[derive(Clone, Default)]
pub struct PrivacyBudgetLedger {
    budgets: Arc<DashMap<DatasetId, Arc<Mutex<PrivacyBudget>>>>,
}

impl PrivacyBudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the budget of a dataset.
    pub fn register(&self, dataset: DatasetId, total: f64) {
        self.insert(dataset, PrivacyBudget::new(total));
    }

    /// Registers a budget with pre-existing consumption, e.g. restored state.
    pub fn insert(&self, dataset: DatasetId, budget: PrivacyBudget) {
        self.budgets.insert(dataset, Arc::new(Mutex::new(budget)));
    }

    pub fn snapshot(&self, dataset: &DatasetId) -> Result<PrivacyBudget, BudgetError> {
        Ok(*self.slot(dataset)?.lock())
    }

    pub fn remaining(&self, dataset: &DatasetId) -> Result<f64, BudgetError> {
        Ok(self.slot(dataset)?.lock().remaining())
    }

    pub fn reserve(&self, dataset: &DatasetId, epsilon: f64) -> Result<Reservation, BudgetError> {
        check_epsilon(epsilon)?;
        let slot = self.slot(dataset)?;
        let mut budget = slot.lock();
        let remaining = budget.total - budget.consumed - budget.reserved;
        if epsilon > remaining + FIT_TOLERANCE {
            let err = BudgetError::Exhausted {
                dataset: dataset.clone(),
                consumed: budget.consumed,
                reserved: budget.reserved,
                remaining: remaining.max(0.0),
                requested: epsilon,
            };
            drop(budget);
            warn!(dataset = %dataset, requested = epsilon, "privacy budget reservation rejected");
            return Err(err);
        }
        budget.reserved = (budget.reserved + epsilon).min(budget.total - budget.consumed);
        let reserved = budget.reserved;
        drop(budget);
        let reservation = Reservation {
            id: random_id("rsv"),
            dataset: dataset.clone(),
            epsilon,
        };
        debug!(
            dataset = %dataset,
            reservation = %reservation.id,
            epsilon,
            reserved,
            "privacy budget reserved"
        );
        Ok(reservation)
    }

    /// Converts `actual` epsilon from reserved to consumed.
    pub fn commit(&self, dataset: &DatasetId, actual: f64) -> Result<PrivacyBudget, BudgetError> {
        check_epsilon(actual)?;
        let slot = self.slot(dataset)?;
        let mut budget = slot.lock();
        budget.consumed += actual;
        budget.reserved = (budget.reserved - actual).max(0.0);
        let after = *budget;
        drop(budget);
        debug!(dataset = %dataset, actual, consumed = after.consumed, "privacy budget committed");
        Ok(after)
    }

    /// Releases a reservation without consuming it.
    pub fn rollback(
        &self,
        dataset: &DatasetId,
        reserved_epsilon: f64,
    ) -> Result<PrivacyBudget, BudgetError> {
        check_epsilon(reserved_epsilon)?;
        let slot = self.slot(dataset)?;
        let mut budget = slot.lock();
        budget.reserved = (budget.reserved - reserved_epsilon).max(0.0);
        let after = *budget;
        drop(budget);
        debug!(dataset = %dataset, reserved_epsilon, reserved = after.reserved, "privacy budget rolled back");
        Ok(after)
    }

    /// Clones the per-dataset lock out of the map so the shard guard is
    /// released before the budget lock is taken.
    fn slot(&self, dataset: &DatasetId) -> Result<Arc<Mutex<PrivacyBudget>>, BudgetError> {
        self.budgets
            .get(dataset)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BudgetError::Missing(dataset.clone()))
    }
}

fn check_epsilon(epsilon: f64) -> Result<(), BudgetError> {
    if !epsilon.is_finite() || epsilon < 0.0 {
        return Err(BudgetError::InvalidEpsilon(epsilon));
    }
    Ok(())
}
