//! Wire types shared by the texcompiler service and its command-line client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Output formats the converter can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "output_format", rename_all = "lowercase")
)]
pub enum OutputFormat {
    Pdf,
    Dvi,
    Ps,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [OutputFormat::Pdf, OutputFormat::Dvi, OutputFormat::Ps];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Dvi => "dvi",
            OutputFormat::Ps => "ps",
        }
    }

    /// File extension the converter writes for this format.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Dvi => "application/x-dvi",
            OutputFormat::Ps => "application/postscript",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a format string is not one of the supported formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFormat(pub String);

impl fmt::Display for UnknownFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported output format `{}`", self.0)
    }
}

impl std::error::Error for UnknownFormat {}

impl FromStr for OutputFormat {
    type Err = UnknownFormat;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pdf" => Ok(OutputFormat::Pdf),
            "dvi" => Ok(OutputFormat::Dvi),
            "ps" => Ok(OutputFormat::Ps),
            other => Err(UnknownFormat(other.to_string())),
        }
    }
}

/// Lifecycle state of a compilation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "task_status", rename_all = "snake_case")
)]
pub enum TaskStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Errored,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Errored => "errored",
        }
    }

    /// Terminal states only change through a forced resubmission.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Errored
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable cause attached to `failed` and `errored` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "failure_reason", rename_all = "snake_case")
)]
pub enum FailureReason {
    CompilationErrors,
    ChecksumMismatch,
    SourceMissing,
    SourceUnavailable,
    CorruptedSource,
    SandboxUnavailable,
    TimeLimitExceeded,
    StorageFailure,
    WorkerLost,
    ArtifactMissing,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CompilationErrors => "compilation_errors",
            FailureReason::ChecksumMismatch => "checksum_mismatch",
            FailureReason::SourceMissing => "source_missing",
            FailureReason::SourceUnavailable => "source_unavailable",
            FailureReason::CorruptedSource => "corrupted_source",
            FailureReason::SandboxUnavailable => "sandbox_unavailable",
            FailureReason::TimeLimitExceeded => "time_limit_exceeded",
            FailureReason::StorageFailure => "storage_failure",
            FailureReason::WorkerLost => "worker_lost",
            FailureReason::ArtifactMissing => "artifact_missing",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub source_id: String,
    pub checksum: String,
    #[serde(alias = "format")]
    pub output_format: String,
    #[serde(default)]
    pub force: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamp_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamp_link: Option<String>,
}

/// Status document returned for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub source_id: String,
    pub checksum: String,
    pub output_format: OutputFormat,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub reason: Option<FailureReason>,
    pub description: Option<String>,
    pub size_bytes: Option<i64>,
    pub task_id: String,
    pub attempt_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Canonical identifier of a task: `source_id/checksum/format`.
pub fn task_id(source_id: &str, checksum: &str, format: OutputFormat) -> String {
    format!("{source_id}/{checksum}/{format}")
}

/// Status resource path for a task, with every component percent-encoded.
pub fn encode_task_path(source_id: &str, checksum: &str, format: OutputFormat) -> String {
    format!(
        "/{}/{}/{}",
        urlencoding::encode(source_id),
        urlencoding::encode(checksum),
        format
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats_only() {
        assert_eq!("pdf".parse::<OutputFormat>(), Ok(OutputFormat::Pdf));
        assert_eq!("ps".parse::<OutputFormat>(), Ok(OutputFormat::Ps));
        assert_eq!(
            "html".parse::<OutputFormat>(),
            Err(UnknownFormat("html".to_string()))
        );
        assert!("PDF".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn task_path_encodes_quoted_checksum() {
        let path = encode_task_path(
            "1902.00123",
            "\"Mon, 01 Jan 2019 00:00:00 GMT\"",
            OutputFormat::Pdf,
        );
        assert_eq!(
            path,
            "/1902.00123/%22Mon%2C%2001%20Jan%202019%2000%3A00%3A00%20GMT%22/pdf"
        );
    }

    #[test]
    fn submit_request_accepts_format_alias() {
        let body = r#"{"source_id":"1","checksum":"abc","format":"dvi"}"#;
        let request: SubmitRequest = serde_json::from_str(body).expect("parse");
        assert_eq!(request.output_format, "dvi");
        assert!(!request.force);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Errored.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
    }
}
