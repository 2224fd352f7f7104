//! Resilience state shared across executions.
//!
//! This module provides:
//! - Circuit breaker keyed by agent, model and tenant
//! - Budget ledger with per-scope, per-period limits

mod budget;
mod circuit_breaker;

pub use budget::{
    BudgetCheck, BudgetDenial, BudgetLedger, BudgetStatus, BudgetWarning, Reservation, WarningKind,
};
pub use circuit_breaker::{
    Admission, BreakerKey, BreakerStatus, CircuitBreaker, CircuitState, Transition,
};

pub(crate) use circuit_breaker::wall_clock;
