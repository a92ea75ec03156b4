//! Infrastructure adapters and runtime bootstrap.

pub mod artifacts;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod memory;
pub mod sandbox;
pub mod telemetry;
