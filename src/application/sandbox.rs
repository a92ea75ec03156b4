//! Capability interfaces for fetching sources and running the converter in isolation.
//!
//! The worker only sees [`execute`]: fetch, stage into a throwaway workspace, run. Any
//! isolation mechanism (plain process with rlimits, container, microVM) fits behind
//! [`Sandbox`].

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use thiserror::Error;
use tracing::warn;

use crate::domain::error::CompileError;
use crate::domain::execution::ExecutionResult;
use crate::domain::task::TaskKey;
use crate::domain::types::FailureReason;

/// Raw source bytes as served by the upstream source-package service.
#[derive(Debug, Clone)]
pub struct SourcePackage {
    pub source_id: String,
    pub etag: String,
    pub bytes: Bytes,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source package not found")]
    NotFound,
    #[error("source checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("source service refused authorization")]
    Unauthorized,
    #[error("source service unavailable: {0}")]
    Unavailable(String),
    #[error("source package exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}

impl FetchError {
    fn into_result(self) -> ExecutionResult {
        match self {
            FetchError::NotFound => ExecutionResult::infra_error(
                FailureReason::SourceMissing,
                "could not retrieve a matching source package (not found)",
            ),
            FetchError::ChecksumMismatch { expected, actual } => ExecutionResult::infra_error(
                FailureReason::ChecksumMismatch,
                CompileError::ChecksumMismatch { expected, actual }.to_string(),
            ),
            FetchError::Unauthorized => ExecutionResult::infra_error(
                FailureReason::SourceUnavailable,
                "there was a problem authorizing the source request",
            ),
            FetchError::Unavailable(detail) => ExecutionResult::infra_error(
                FailureReason::SourceUnavailable,
                format!("there was a problem retrieving the source files: {detail}"),
            ),
            FetchError::TooLarge { limit } => ExecutionResult::infra_error(
                FailureReason::CorruptedSource,
                format!("source package exceeds the {limit} byte limit"),
            ),
        }
    }
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Retrieve the package for `source_id`, verifying it matches `checksum`.
    async fn fetch(&self, source_id: &str, checksum: &str) -> Result<SourcePackage, FetchError>;
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("source package is corrupted: {0}")]
    Corrupted(String),
    #[error("failed to prepare workspace: {0}")]
    Io(#[from] std::io::Error),
}

/// An isolated directory holding one staged source tree. Removed on drop.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn new(dir: TempDir) -> Self {
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Everything the converter needs beyond the staged tree.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub key: TaskKey,
    pub stamp_label: Option<String>,
    pub stamp_link: Option<String>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn stage(&self, source: SourcePackage) -> Result<Workspace, SandboxError>;

    /// Run the converter against `workspace`, enforcing `timeout` as a hard wall-clock limit.
    async fn run(
        &self,
        workspace: &Workspace,
        request: &RunRequest,
        timeout: Duration,
    ) -> ExecutionResult;
}

/// Fetch, stage, and run one attempt. Never fails: every problem is folded into the result.
pub async fn execute(
    sandbox: &dyn Sandbox,
    fetcher: &dyn SourceFetcher,
    request: &RunRequest,
    timeout: Duration,
) -> ExecutionResult {
    let key = &request.key;
    let source = match fetcher.fetch(key.source_id(), key.checksum()).await {
        Ok(source) => source,
        Err(err) => {
            warn!(
                target = "texcompiler::sandbox",
                op = "sandbox::fetch",
                task_id = %key,
                error = %err,
                "Source retrieval failed"
            );
            return err.into_result();
        }
    };

    let workspace = match sandbox.stage(source).await {
        Ok(workspace) => workspace,
        Err(SandboxError::Corrupted(detail)) => {
            return ExecutionResult::infra_error(
                FailureReason::CorruptedSource,
                format!("source package is corrupted: {detail}"),
            );
        }
        Err(SandboxError::Io(err)) => {
            return ExecutionResult::infra_error(
                FailureReason::SandboxUnavailable,
                format!("failed to prepare workspace: {err}"),
            );
        }
    };

    sandbox.run(&workspace, request, timeout).await
}
