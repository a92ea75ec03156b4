mod compile;
mod context;
mod local;
mod reap;

pub use compile::{CompileJobPayload, process_compile_job};
pub use context::{JobWorkerContext, job_failed};
pub use local::LocalWorkerPool;
pub use reap::{InvalidSchedule, ReapLeasesJob, process_reap_leases_job, reap_schedule};
