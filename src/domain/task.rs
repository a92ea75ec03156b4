//! Task identity.
//!
//! A task is addressed solely by `(source_id, checksum, output_format)`. The checksum is
//! opaque: it is carried exactly as the upstream source service reported it, quotes included.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::types::OutputFormat;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    source_id: String,
    checksum: String,
    output_format: OutputFormat,
}

impl TaskKey {
    /// Build a key, rejecting identifiers that cannot be addressed over HTTP.
    pub fn new(
        source_id: impl Into<String>,
        checksum: impl Into<String>,
        output_format: OutputFormat,
    ) -> Result<Self, DomainError> {
        let source_id = source_id.into();
        let checksum = checksum.into();

        if source_id.trim().is_empty() {
            return Err(DomainError::validation("source_id must not be empty"));
        }
        if source_id == "." || source_id == ".." {
            return Err(DomainError::validation("source_id must not be a dot segment"));
        }
        if source_id.contains('/') {
            return Err(DomainError::validation("source_id must not contain `/`"));
        }
        if source_id.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "source_id must not contain control characters",
            ));
        }
        if checksum.is_empty() {
            return Err(DomainError::validation("checksum must not be empty"));
        }

        Ok(Self {
            source_id,
            checksum,
            output_format,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn output_format(&self) -> OutputFormat {
        self.output_format
    }

    /// Canonical `source_id/checksum/format` identifier.
    pub fn task_id(&self) -> String {
        texcompiler_api_types::task_id(&self.source_id, &self.checksum, self.output_format)
    }

    /// Percent-encoded status resource path, used for `Location` headers.
    pub fn location(&self) -> String {
        texcompiler_api_types::encode_task_path(
            &self.source_id,
            &self.checksum,
            self.output_format,
        )
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.source_id, self.checksum, self.output_format
        )
    }
}
