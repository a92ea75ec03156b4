use apalis::prelude::{Data, Error as ApalisError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::worker::ProcessOutcome;
use crate::domain::error::DomainError;
use crate::domain::task::TaskKey;
use crate::domain::types::OutputFormat;

use super::context::{JobWorkerContext, job_failed};

/// Dispatch message for one compilation attempt. Carries only the task key; everything else
/// is read from the task record at claim time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileJobPayload {
    pub source_id: String,
    pub checksum: String,
    pub output_format: OutputFormat,
}

impl From<&TaskKey> for CompileJobPayload {
    fn from(key: &TaskKey) -> Self {
        Self {
            source_id: key.source_id().to_string(),
            checksum: key.checksum().to_string(),
            output_format: key.output_format(),
        }
    }
}

impl TryFrom<CompileJobPayload> for TaskKey {
    type Error = DomainError;

    fn try_from(payload: CompileJobPayload) -> Result<Self, Self::Error> {
        TaskKey::new(payload.source_id, payload.checksum, payload.output_format)
    }
}

/// Only store failures surface as job errors. Compilation outcomes, including failures,
/// are recorded on the task and the message is acknowledged.
pub async fn process_compile_job(
    payload: CompileJobPayload,
    context: Data<JobWorkerContext>,
) -> Result<(), ApalisError> {
    let key = TaskKey::try_from(payload).map_err(job_failed)?;
    let outcome = context.worker.process(&key).await.map_err(job_failed)?;

    if !matches!(outcome, ProcessOutcome::Finished(_)) {
        debug!(
            target = "texcompiler::jobs::compile",
            task_id = %key,
            outcome = ?outcome,
            "Compile job ended without a transition"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_lowercase_format() {
        let key = TaskKey::new("1902.00123", "\"etag\"", OutputFormat::Ps).expect("key");
        let payload = CompileJobPayload::from(&key);
        let json = serde_json::to_value(&payload).expect("json");

        assert_eq!(json["output_format"], "ps");
        assert_eq!(json["checksum"], "\"etag\"");
        assert_eq!(TaskKey::try_from(payload).expect("key"), key);
    }

    #[test]
    fn payload_with_invalid_source_is_rejected() {
        let payload = CompileJobPayload {
            source_id: "..".to_string(),
            checksum: "x".to_string(),
            output_format: OutputFormat::Pdf,
        };
        assert!(TaskKey::try_from(payload).is_err());
    }
}
