pub mod circuit_breaker;
pub mod database;
pub mod health;
pub mod memory_queue;
pub mod queue;
pub mod redis_queue;
pub mod sheets;
pub mod shopee;
pub mod telegram;
