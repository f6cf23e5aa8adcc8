//! Scan worker: remote tool execution agent for a pentest orchestrator.

pub mod config;
pub mod connection;
pub mod error;
pub mod orchestrator;
pub mod worker;
