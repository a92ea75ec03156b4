//! Building and tearing down the converter process.

use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::config::{SandboxRuntime, SandboxSettings};
use crate::domain::types::OutputFormat;

/// Mount point of the workspace inside the container image.
pub const CONTAINER_WORKDIR: &str = "/autotex";

const DEFAULT_PAPER_SIZE: &str = "letter";

/// Docker reserves these exit codes for its own failures.
const CONTAINER_RUNTIME_EXIT_CODES: [i32; 3] = [125, 126, 127];

#[derive(Debug, Clone)]
pub struct ConverterArgs<'a> {
    pub source_id: &'a str,
    pub format: OutputFormat,
    pub timeout: Duration,
    pub stamp_label: Option<&'a str>,
    pub stamp_link: Option<&'a str>,
    pub verbose: bool,
}

impl ConverterArgs<'_> {
    pub fn to_vec(&self, workdir: &str) -> Vec<String> {
        let mut args = vec![
            "-S".to_string(),
            workdir.to_string(),
            "-p".to_string(),
            self.source_id.to_string(),
            "-f".to_string(),
            self.format.as_str().to_string(),
            "-T".to_string(),
            self.timeout.as_secs().max(1).to_string(),
            "-t".to_string(),
            DEFAULT_PAPER_SIZE.to_string(),
            "-q".to_string(),
        ];
        if let Some(label) = self.stamp_label {
            args.push("-l".to_string());
            args.push(label.to_string());
        }
        if let Some(link) = self.stamp_link {
            args.push("-L".to_string());
            args.push(link.to_string());
        }
        if self.verbose {
            args.push("-v".to_string());
        }
        args
    }
}

#[derive(Debug, Clone)]
pub enum Launcher {
    /// Runs the converter directly in its own process group with CPU and address-space limits.
    Process {
        converter_path: PathBuf,
        memory_limit_mb: NonZeroU64,
        cpu_seconds: NonZeroU64,
    },
    /// Runs the converter image with networking disabled.
    Container {
        docker_binary: PathBuf,
        image: String,
        converter_path: PathBuf,
        memory_limit_mb: NonZeroU64,
        cpu_limit: f64,
    },
}

impl Launcher {
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        match settings.runtime {
            SandboxRuntime::Process => Launcher::Process {
                converter_path: settings.converter_path.clone(),
                memory_limit_mb: settings.memory_limit_mb,
                cpu_seconds: settings.cpu_seconds,
            },
            SandboxRuntime::Container => Launcher::Container {
                docker_binary: settings.docker_binary.clone(),
                image: settings.image.clone(),
                converter_path: settings.converter_path.clone(),
                memory_limit_mb: settings.memory_limit_mb,
                cpu_limit: settings.cpu_limit,
            },
        }
    }

    pub fn runtime(&self) -> SandboxRuntime {
        match self {
            Launcher::Process { .. } => SandboxRuntime::Process,
            Launcher::Container { .. } => SandboxRuntime::Container,
        }
    }

    /// `name` labels the container so a timed-out run can be removed by name.
    pub fn command(&self, workspace: &Path, args: &ConverterArgs<'_>, name: &str) -> Command {
        let mut command = match self {
            Launcher::Process {
                converter_path,
                memory_limit_mb,
                cpu_seconds,
            } => {
                let mut command = Command::new(converter_path);
                command
                    .args(args.to_vec(&workspace.to_string_lossy()))
                    .current_dir(workspace);
                apply_rlimits(&mut command, memory_limit_mb.get(), cpu_seconds.get());
                command
            }
            Launcher::Container {
                docker_binary,
                image,
                converter_path,
                memory_limit_mb,
                cpu_limit,
            } => {
                let mut command = Command::new(docker_binary);
                command
                    .args(container_args(
                        workspace,
                        image,
                        *memory_limit_mb,
                        *cpu_limit,
                        name,
                    ))
                    .arg(converter_path)
                    .args(args.to_vec(CONTAINER_WORKDIR));
                command
            }
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        command
    }

    /// Whether `exit_code` means the runtime itself failed rather than the converter.
    pub fn is_runtime_failure(&self, exit_code: i32) -> bool {
        matches!(self, Launcher::Container { .. })
            && CONTAINER_RUNTIME_EXIT_CODES.contains(&exit_code)
    }

    /// Kill everything the run started. The process group covers converter children; a
    /// container keeps running after its client dies and has to be removed separately.
    pub async fn terminate(&self, pid: Option<u32>, name: &str) {
        if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
            // SAFETY: killpg has no memory-safety preconditions; a stale group id yields ESRCH.
            let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    warn!(
                        target = "texcompiler::sandbox",
                        op = "sandbox::terminate",
                        pid,
                        error = %err,
                        "Failed to signal converter process group"
                    );
                }
            }
        }

        if let Launcher::Container { docker_binary, .. } = self {
            let removed = Command::new(docker_binary)
                .args(["rm", "--force", name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(err) = removed {
                warn!(
                    target = "texcompiler::sandbox",
                    op = "sandbox::terminate",
                    container = name,
                    error = %err,
                    "Failed to remove timed-out container"
                );
            }
        }
    }
}

fn container_args(
    workspace: &Path,
    image: &str,
    memory_limit_mb: NonZeroU64,
    cpu_limit: f64,
    name: &str,
) -> Vec<String> {
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network".to_string(),
        "none".to_string(),
        "--memory".to_string(),
        format!("{memory_limit_mb}m"),
        "--cpus".to_string(),
        cpu_limit.to_string(),
        "-v".to_string(),
        format!("{}:{CONTAINER_WORKDIR}", workspace.display()),
        image.to_string(),
    ]
}

fn apply_rlimits(command: &mut Command, memory_limit_mb: u64, cpu_seconds: u64) {
    let address_space = memory_limit_mb.saturating_mul(1024 * 1024);
    // SAFETY: the closure only calls async-signal-safe setrlimit between fork and exec.
    unsafe {
        command.pre_exec(move || {
            set_limit(libc::RLIMIT_CPU, cpu_seconds)?;
            set_limit(libc::RLIMIT_AS, address_space)?;
            Ok(())
        });
    }
}

fn set_limit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_args_carry_stamp_and_verbosity() {
        let args = ConverterArgs {
            source_id: "1902.00123",
            format: OutputFormat::Pdf,
            timeout: Duration::from_secs(600),
            stamp_label: Some("arXiv:1902.00123v1"),
            stamp_link: Some("https://arxiv.org/abs/1902.00123v1"),
            verbose: true,
        };

        insta::assert_snapshot!(args.to_vec(CONTAINER_WORKDIR).join(" "), @"-S /autotex -p 1902.00123 -f pdf -T 600 -t letter -q -l arXiv:1902.00123v1 -L https://arxiv.org/abs/1902.00123v1 -v");
    }

    #[test]
    fn container_invocation_disables_networking() {
        let args = container_args(
            Path::new("/tmp/ws"),
            "texlive:2023",
            NonZeroU64::new(2048).expect("non-zero"),
            1.5,
            "texcompiler-run",
        );

        insta::assert_snapshot!(args.join(" "), @"run --rm --name texcompiler-run --network none --memory 2048m --cpus 1.5 -v /tmp/ws:/autotex texlive:2023");
    }

    #[test]
    fn only_container_runtimes_reserve_exit_codes() {
        let process = Launcher::Process {
            converter_path: PathBuf::from("/bin/autotex.pl"),
            memory_limit_mb: NonZeroU64::new(1024).expect("non-zero"),
            cpu_seconds: NonZeroU64::new(60).expect("non-zero"),
        };
        let container = Launcher::Container {
            docker_binary: PathBuf::from("docker"),
            image: "texlive".to_string(),
            converter_path: PathBuf::from("/bin/autotex.pl"),
            memory_limit_mb: NonZeroU64::new(1024).expect("non-zero"),
            cpu_limit: 1.0,
        };

        assert!(!process.is_runtime_failure(125));
        assert!(container.is_runtime_failure(125));
        assert!(!container.is_runtime_failure(1));
    }
}
