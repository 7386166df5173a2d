pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod retry;
pub mod runtime;
pub mod sandbox;
pub mod shutdown;
pub mod store;
