pub mod circuit_breaker;
pub mod event;
pub mod health;
pub mod order;
pub mod queue;
pub mod reconciliation;
pub mod report;
pub mod retry;
pub mod stats;
pub mod validation;
