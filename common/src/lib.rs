// Distributed batch-job coordination: leader-gated execution and job chaining

pub mod bootstrap;
pub mod config;
pub mod coordination;
pub mod db;
pub mod errors;
pub mod gate;
pub mod models;
pub mod node;
pub mod schedule;
pub mod scheduler;
pub mod status;
pub mod telemetry;
