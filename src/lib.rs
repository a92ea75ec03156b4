//! texcompiler: a TeX compilation service.
//!
//! Submissions are deduplicated per `(source_id, checksum, format)`, dispatched to a leased
//! worker pool, and compiled in a sandbox. Results and logs are served back over HTTP.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
