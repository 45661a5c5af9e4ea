pub mod processor;
pub mod producer;
pub mod reconciliation;
pub mod sinks;
pub mod stats;
pub mod worker;
