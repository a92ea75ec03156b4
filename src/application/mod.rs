//! Application services: submission, execution, and status resolution.

pub mod artifacts;
pub mod error;
pub mod jobs;
pub mod repos;
pub mod sandbox;
pub mod status;
pub mod submission;
pub mod worker;
