//! Privacy budget accounting.
//!
//! Every dataset owns one [`PrivacyBudget`]. Query execution reserves its
//! estimated epsilon before touching data, then either commits the epsilon
//! actually spent or rolls the reservation back. All mutation of a budget
//! happens under that budget's own lock, so concurrent reservations on one
//! dataset can never oversell it while different datasets never contend.

pub mod budget;

pub use budget::{BudgetError, PrivacyBudget, PrivacyBudgetLedger, Reservation};
