//! Sandboxed converter runs.
//!
//! [`CommandSandbox`] stages each package into its own temporary directory and runs the
//! converter there, either as a resource-limited child process or inside a network-less
//! container. The converter writes outputs to `tex_cache/` and its own log to
//! `tex_logs/autotex.log`; both are collected after the run, including timed-out runs.
//! stdout and stderr feed one buffer in the order chunks arrive, so lines from the two
//! streams interleave roughly as the converter wrote them.

mod launcher;
mod log;
mod workspace;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::sandbox::{RunRequest, Sandbox, SandboxError, SourcePackage, Workspace};
use crate::config::SandboxSettings;
use crate::domain::execution::ExecutionResult;
use crate::domain::types::{FailureReason, OutputFormat};

pub use launcher::{ConverterArgs, Launcher};
pub use log::{LogBuffer, SharedLog};

const OUTPUT_DIR: &str = "tex_cache";
const CONVERTER_LOG: &str = "tex_logs/autotex.log";
/// How long to keep reading pipes after the process group was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct CommandSandbox {
    launcher: Launcher,
    workspace_root: Option<PathBuf>,
    max_log_bytes: usize,
    max_unpacked_bytes: u64,
    verbose: bool,
}

impl CommandSandbox {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            launcher: Launcher::from_settings(settings),
            workspace_root: settings.workspace_root.clone(),
            max_log_bytes: settings.max_log_bytes,
            max_unpacked_bytes: settings.max_unpacked_bytes.get(),
            verbose: settings.verbose,
        }
    }

    /// Converter log first, then whatever the process printed, capped at `max_log_bytes`.
    async fn collect_log(&self, workspace: &Path, captured: LogBuffer) -> Bytes {
        let mut combined = LogBuffer::new(self.max_log_bytes);
        if let Ok(converter_log) = fs::read(workspace.join(CONVERTER_LOG)).await {
            combined.push(&converter_log);
        }
        if !captured.is_empty() {
            combined.append(captured);
        }
        combined.finish()
    }
}

#[async_trait]
impl Sandbox for CommandSandbox {
    async fn stage(&self, source: SourcePackage) -> Result<Workspace, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("texcompiler-");
        let dir = match self.workspace_root.as_deref() {
            Some(root) => {
                fs::create_dir_all(root).await?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let target = dir.path().to_path_buf();
        let max_unpacked = self.max_unpacked_bytes;
        let SourcePackage {
            source_id, bytes, ..
        } = source;
        let layout = tokio::task::spawn_blocking(move || {
            workspace::unpack(&target, &source_id, &bytes, max_unpacked)
        })
        .await
        .map_err(|err| SandboxError::Io(std::io::Error::other(err)))??;

        debug!(
            target = "texcompiler::sandbox",
            op = "sandbox::stage",
            workspace = %dir.path().display(),
            ?layout,
            "Staged source package"
        );
        Ok(Workspace::new(dir))
    }

    async fn run(
        &self,
        workspace: &Workspace,
        request: &RunRequest,
        timeout: Duration,
    ) -> ExecutionResult {
        let key = &request.key;
        let format = key.output_format();
        let args = ConverterArgs {
            source_id: key.source_id(),
            format,
            timeout,
            stamp_label: request.stamp_label.as_deref(),
            stamp_link: request.stamp_link.as_deref(),
            verbose: self.verbose,
        };
        let name = format!("texcompiler-{}", Uuid::new_v4());
        let started = Instant::now();

        let mut child = match self.launcher.command(workspace.path(), &args, &name).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    target = "texcompiler::sandbox",
                    op = "sandbox::run",
                    task_id = %key,
                    runtime = ?self.launcher.runtime(),
                    error = %err,
                    "Failed to launch converter"
                );
                return ExecutionResult::infra_error(
                    FailureReason::SandboxUnavailable,
                    format!("failed to launch converter: {err}"),
                );
            }
        };
        let pid = child.id();
        let captured = SharedLog::new(self.max_log_bytes);
        let mut stdout = captured.spawn_capture(child.stdout.take());
        let mut stderr = captured.spawn_capture(child.stderr.take());

        let finished = tokio::time::timeout(timeout, async {
            let status = child.wait().await;
            let _ = tokio::join!(&mut stdout, &mut stderr);
            status
        })
        .await;

        let status = match finished {
            Ok(status) => status,
            Err(_) => {
                self.launcher.terminate(pid, &name).await;
                let _ = child.kill().await;
                // A reader may already have completed inside the first join.
                let drained = tokio::time::timeout(DRAIN_GRACE, async {
                    for reader in [&mut stdout, &mut stderr] {
                        if !reader.is_finished() {
                            let _ = reader.await;
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    stdout.abort();
                    stderr.abort();
                }
                info!(
                    target = "texcompiler::sandbox",
                    op = "sandbox::run",
                    task_id = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Converter exceeded time limit"
                );
                let log = self.collect_log(workspace.path(), captured.take()).await;
                return ExecutionResult::timeout(log);
            }
        };

        let log = self.collect_log(workspace.path(), captured.take()).await;
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                return ExecutionResult::infra_error(
                    FailureReason::SandboxUnavailable,
                    format!("failed to wait for converter: {err}"),
                )
                .with_log(log);
            }
        };
        let exit_code = status.code();

        debug!(
            target = "texcompiler::sandbox",
            op = "sandbox::run",
            task_id = %key,
            exit_code = ?exit_code,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Converter exited"
        );

        if let Some(code) = exit_code.filter(|code| self.launcher.is_runtime_failure(*code)) {
            return ExecutionResult::infra_error(
                FailureReason::SandboxUnavailable,
                format!("container runtime failed with exit code {code}"),
            )
            .with_log(log)
            .with_exit_code(exit_code);
        }

        if !status.success() {
            let detail = match exit_code {
                Some(code) => format!("converter exited with status {code}"),
                None => "converter was terminated by a signal".to_string(),
            };
            return ExecutionResult::compile_failure(exit_code, log, detail);
        }

        match find_output(workspace.path(), key.source_id(), format).await {
            Some(artifact) => ExecutionResult::success(exit_code.unwrap_or(0), log, artifact),
            None => ExecutionResult::compile_failure(
                exit_code,
                log,
                format!("converter produced no {} output", format.as_str()),
            ),
        }
    }
}

/// Prefer `tex_cache/{source}.{ext}`, otherwise take the first file with the right extension.
async fn find_output(workspace: &Path, source_id: &str, format: OutputFormat) -> Option<Bytes> {
    let output_dir = workspace.join(OUTPUT_DIR);
    let extension = format.extension();
    if let Ok(bytes) = fs::read(output_dir.join(format!("{source_id}.{extension}"))).await {
        return Some(Bytes::from(bytes));
    }

    let mut entries = fs::read_dir(&output_dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
            candidates.push(path);
        }
    }
    candidates.sort();

    let first = candidates.into_iter().next()?;
    fs::read(first).await.ok().map(Bytes::from)
}
