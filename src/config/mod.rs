//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::application::jobs::reap_schedule;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "texcompiler";
const ENV_PREFIX: &str = "TEXCOMPILER";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_HTTP_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_JOBS_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_WORKER_CONCURRENCY: u32 = 2;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_SECS: u64 = 5;
const DEFAULT_RETRY_MAX_SECS: u64 = 300;
const DEFAULT_LEASE_SECS: u64 = 60;
const DEFAULT_REAPER_SCHEDULE: &str = "*/30 * * * * *";
const DEFAULT_CONVERTER_PATH: &str = "/bin/autotex.pl";
const DEFAULT_DOCKER_BINARY: &str = "docker";
const DEFAULT_CONVERTER_IMAGE: &str = "arxiv/converter:0.9.14";
const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_LOG_BYTES: u64 = 1024 * 1024;
const DEFAULT_MEMORY_LIMIT_MB: u64 = 4096;
const DEFAULT_CPU_LIMIT: f64 = 1.0;
const DEFAULT_CPU_SECONDS: u64 = 900;
const DEFAULT_SOURCE_ENDPOINT: &str = "http://localhost:8001/filemanager/api";
const DEFAULT_SOURCE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SOURCE_MAX_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MAX_UNPACKED_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";

/// Command-line arguments for the texcompiler binary.
#[derive(Debug, Parser)]
#[command(name = "texcompiler", version, about = "TeX compilation service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TEXCOMPILER_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP API (and, unless disabled, embedded workers).
    Serve(Box<ServeArgs>),
    /// Run compile workers and the lease reaper without the HTTP API.
    Worker(Box<WorkerArgs>),
    /// Apply database migrations and exit.
    Migrate(MigrateArgs),
}

/// Where task records and dispatch messages live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Memory,
}

/// How the converter is isolated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRuntime {
    /// Direct child process in its own process group with rlimits.
    Process,
    /// One disposable container per attempt, without network.
    Container,
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub overrides: RuntimeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub runtime: RuntimeOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Run compile workers inside the API process.
    #[arg(
        long = "jobs-embedded-workers",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub jobs_embedded_workers: Option<bool>,
}

/// Overrides shared by every long-running subcommand.
#[derive(Debug, Args, Default, Clone)]
pub struct RuntimeOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the HTTP database pool size.
    #[arg(long = "database-http-max-connections", value_name = "COUNT")]
    pub database_http_max_connections: Option<u32>,

    /// Override the jobs database pool size.
    #[arg(long = "database-jobs-max-connections", value_name = "COUNT")]
    pub database_jobs_max_connections: Option<u32>,

    /// Select the task store backend.
    #[arg(long = "backend", value_name = "KIND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Override the number of concurrent compile attempts per worker process.
    #[arg(long = "jobs-worker-concurrency", value_name = "COUNT")]
    pub jobs_worker_concurrency: Option<u32>,

    /// Override the retry budget for infrastructure errors and timeouts.
    #[arg(long = "jobs-max-retries", value_name = "COUNT")]
    pub jobs_max_retries: Option<u32>,

    /// Override the worker lease duration.
    #[arg(long = "jobs-lease-seconds", value_name = "SECONDS")]
    pub jobs_lease_seconds: Option<u64>,

    /// Select the sandbox runtime.
    #[arg(long = "sandbox-runtime", value_name = "RUNTIME", value_enum)]
    pub sandbox_runtime: Option<SandboxRuntime>,

    /// Override the converter executable path.
    #[arg(long = "sandbox-converter-path", value_name = "PATH")]
    pub sandbox_converter_path: Option<PathBuf>,

    /// Override the converter container image.
    #[arg(long = "sandbox-image", value_name = "IMAGE")]
    pub sandbox_image: Option<String>,

    /// Override the per-attempt wall-clock limit.
    #[arg(long = "sandbox-timeout-seconds", value_name = "SECONDS")]
    pub sandbox_timeout_seconds: Option<u64>,

    /// Override the source-package service endpoint.
    #[arg(long = "source-endpoint", value_name = "URL")]
    pub source_endpoint: Option<String>,

    /// Override the artifact storage directory.
    #[arg(long = "artifacts-directory", value_name = "PATH")]
    pub artifacts_directory: Option<PathBuf>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub backend: BackendKind,
    pub jobs: JobsSettings,
    pub sandbox: SandboxSettings,
    pub source: SourceSettings,
    pub artifacts: ArtifactSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub http_max_connections: NonZeroU32,
    pub jobs_max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct JobsSettings {
    pub worker_concurrency: NonZeroU32,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub lease: Duration,
    pub reaper_schedule: String,
    pub embedded_workers: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub runtime: SandboxRuntime,
    pub converter_path: PathBuf,
    pub docker_binary: PathBuf,
    pub image: String,
    pub timeout: Duration,
    pub max_log_bytes: usize,
    pub memory_limit_mb: NonZeroU64,
    pub cpu_limit: f64,
    pub cpu_seconds: NonZeroU64,
    /// Ceiling on a package's decompressed size.
    pub max_unpacked_bytes: NonZeroU64,
    pub workspace_root: Option<PathBuf>,
    pub verbose: bool,
}

#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub endpoint: String,
    pub verify_checksum: bool,
    pub token: Option<String>,
    pub timeout: Duration,
    pub max_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct ArtifactSettings {
    pub directory: PathBuf,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Worker(args)) => raw.apply_runtime_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    backend: RawBackendSettings,
    jobs: RawJobsSettings,
    sandbox: RawSandboxSettings,
    source: RawSourceSettings,
    artifacts: RawArtifactSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(embedded) = overrides.jobs_embedded_workers {
            self.jobs.embedded_workers = Some(embedded);
        }

        self.apply_runtime_overrides(&overrides.runtime);
    }

    fn apply_runtime_overrides(&mut self, overrides: &RuntimeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_http_max_connections {
            self.database.http_max_connections = Some(max);
        }
        if let Some(max) = overrides.database_jobs_max_connections {
            self.database.jobs_max_connections = Some(max);
        }
        if let Some(kind) = overrides.backend {
            self.backend.kind = Some(kind);
        }
        if let Some(value) = overrides.jobs_worker_concurrency {
            self.jobs.worker_concurrency = Some(value);
        }
        if let Some(value) = overrides.jobs_max_retries {
            self.jobs.max_retries = Some(value);
        }
        if let Some(value) = overrides.jobs_lease_seconds {
            self.jobs.lease_seconds = Some(value);
        }
        if let Some(runtime) = overrides.sandbox_runtime {
            self.sandbox.runtime = Some(runtime);
        }
        if let Some(path) = overrides.sandbox_converter_path.as_ref() {
            self.sandbox.converter_path = Some(path.clone());
        }
        if let Some(image) = overrides.sandbox_image.as_ref() {
            self.sandbox.image = Some(image.clone());
        }
        if let Some(seconds) = overrides.sandbox_timeout_seconds {
            self.sandbox.timeout_seconds = Some(seconds);
        }
        if let Some(endpoint) = overrides.source_endpoint.as_ref() {
            self.source.endpoint = Some(endpoint.clone());
        }
        if let Some(directory) = overrides.artifacts_directory.as_ref() {
            self.artifacts.directory = Some(directory.clone());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            backend,
            jobs,
            sandbox,
            source,
            artifacts,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let backend = backend.kind.unwrap_or(BackendKind::Postgres);
        let jobs = build_jobs_settings(jobs)?;
        let sandbox = build_sandbox_settings(sandbox)?;
        let source = build_source_settings(source)?;
        let artifacts = build_artifact_settings(artifacts)?;

        if backend == BackendKind::Postgres && database.url.is_none() {
            return Err(LoadError::invalid(
                "database.url",
                "required when backend.kind is `postgres`",
            ));
        }

        Ok(Self {
            server,
            logging,
            database,
            backend,
            jobs,
            sandbox,
            source,
            artifacts,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown = Duration::from_secs(non_zero_secs(
        graceful_secs,
        "server.graceful_shutdown_seconds",
    )?);

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);

    let http_value = database
        .http_max_connections
        .unwrap_or(DEFAULT_DB_HTTP_MAX_CONNECTIONS);
    let jobs_value = database
        .jobs_max_connections
        .unwrap_or(DEFAULT_DB_JOBS_MAX_CONNECTIONS);

    let http_max_connections = non_zero_u32(http_value.into(), "database.http_max_connections")?;
    let jobs_max_connections = non_zero_u32(jobs_value.into(), "database.jobs_max_connections")?;

    Ok(DatabaseSettings {
        url,
        http_max_connections,
        jobs_max_connections,
    })
}

fn build_jobs_settings(jobs: RawJobsSettings) -> Result<JobsSettings, LoadError> {
    let worker_concurrency = non_zero_u32(
        jobs.worker_concurrency
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY)
            .into(),
        "jobs.worker_concurrency",
    )?;

    let retry_base = Duration::from_secs(non_zero_secs(
        jobs.retry_base_seconds.unwrap_or(DEFAULT_RETRY_BASE_SECS),
        "jobs.retry_base_seconds",
    )?);
    let retry_max = Duration::from_secs(non_zero_secs(
        jobs.retry_max_seconds.unwrap_or(DEFAULT_RETRY_MAX_SECS),
        "jobs.retry_max_seconds",
    )?);
    if retry_max < retry_base {
        return Err(LoadError::invalid(
            "jobs.retry_max_seconds",
            "must not be smaller than jobs.retry_base_seconds",
        ));
    }

    let lease = Duration::from_secs(non_zero_secs(
        jobs.lease_seconds.unwrap_or(DEFAULT_LEASE_SECS),
        "jobs.lease_seconds",
    )?);

    let reaper_schedule = non_blank(jobs.reaper_schedule)
        .unwrap_or_else(|| DEFAULT_REAPER_SCHEDULE.to_string());
    reap_schedule(&reaper_schedule)
        .map_err(|err| LoadError::invalid("jobs.reaper_schedule", err.to_string()))?;

    Ok(JobsSettings {
        worker_concurrency,
        max_retries: jobs.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        retry_base,
        retry_max,
        lease,
        reaper_schedule,
        embedded_workers: jobs.embedded_workers.unwrap_or(true),
    })
}

fn build_sandbox_settings(sandbox: RawSandboxSettings) -> Result<SandboxSettings, LoadError> {
    let converter_path = sandbox
        .converter_path
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONVERTER_PATH));
    if converter_path.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "sandbox.converter_path",
            "path must not be empty",
        ));
    }

    let docker_binary = sandbox
        .docker_binary
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_BINARY));
    if docker_binary.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "sandbox.docker_binary",
            "path must not be empty",
        ));
    }

    let image =
        non_blank(sandbox.image).unwrap_or_else(|| DEFAULT_CONVERTER_IMAGE.to_string());

    let timeout = Duration::from_secs(non_zero_secs(
        sandbox
            .timeout_seconds
            .unwrap_or(DEFAULT_SANDBOX_TIMEOUT_SECS),
        "sandbox.timeout_seconds",
    )?);

    let max_log_bytes_value = sandbox.max_log_bytes.unwrap_or(DEFAULT_MAX_LOG_BYTES);
    if max_log_bytes_value == 0 {
        return Err(LoadError::invalid(
            "sandbox.max_log_bytes",
            "must be greater than zero",
        ));
    }
    let max_log_bytes = usize::try_from(max_log_bytes_value).map_err(|_| {
        LoadError::invalid(
            "sandbox.max_log_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    let memory_limit_mb = NonZeroU64::new(
        sandbox
            .memory_limit_mb
            .unwrap_or(DEFAULT_MEMORY_LIMIT_MB),
    )
    .ok_or_else(|| LoadError::invalid("sandbox.memory_limit_mb", "must be greater than zero"))?;

    let cpu_limit = sandbox.cpu_limit.unwrap_or(DEFAULT_CPU_LIMIT);
    if !(cpu_limit.is_finite() && cpu_limit > 0.0) {
        return Err(LoadError::invalid(
            "sandbox.cpu_limit",
            "must be a positive number",
        ));
    }

    let cpu_seconds = NonZeroU64::new(sandbox.cpu_seconds.unwrap_or(DEFAULT_CPU_SECONDS))
        .ok_or_else(|| LoadError::invalid("sandbox.cpu_seconds", "must be greater than zero"))?;

    let max_unpacked_bytes = NonZeroU64::new(
        sandbox
            .max_unpacked_bytes
            .unwrap_or(DEFAULT_MAX_UNPACKED_BYTES),
    )
    .ok_or_else(|| {
        LoadError::invalid("sandbox.max_unpacked_bytes", "must be greater than zero")
    })?;

    let workspace_root = sandbox
        .workspace_root
        .filter(|path| !path.as_os_str().is_empty());

    Ok(SandboxSettings {
        runtime: sandbox.runtime.unwrap_or(SandboxRuntime::Container),
        converter_path,
        docker_binary,
        image,
        timeout,
        max_log_bytes,
        memory_limit_mb,
        cpu_limit,
        cpu_seconds,
        max_unpacked_bytes,
        workspace_root,
        verbose: sandbox.verbose.unwrap_or(true),
    })
}

fn build_source_settings(source: RawSourceSettings) -> Result<SourceSettings, LoadError> {
    let endpoint =
        non_blank(source.endpoint).unwrap_or_else(|| DEFAULT_SOURCE_ENDPOINT.to_string());
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(LoadError::invalid(
            "source.endpoint",
            format!("`{endpoint}` is not an http(s) URL"),
        ));
    }

    let timeout = Duration::from_secs(non_zero_secs(
        source.timeout_seconds.unwrap_or(DEFAULT_SOURCE_TIMEOUT_SECS),
        "source.timeout_seconds",
    )?);

    let max_bytes = NonZeroU64::new(source.max_bytes.unwrap_or(DEFAULT_SOURCE_MAX_BYTES))
        .ok_or_else(|| LoadError::invalid("source.max_bytes", "must be greater than zero"))?;

    Ok(SourceSettings {
        endpoint: endpoint.trim_end_matches('/').to_string(),
        verify_checksum: source.verify_checksum.unwrap_or(true),
        token: non_blank(source.token),
        timeout,
        max_bytes,
    })
}

fn build_artifact_settings(artifacts: RawArtifactSettings) -> Result<ArtifactSettings, LoadError> {
    let directory = artifacts
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "artifacts.directory",
            "path must not be empty",
        ));
    }

    Ok(ArtifactSettings { directory })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    http_max_connections: Option<u32>,
    jobs_max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<BackendKind>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawJobsSettings {
    worker_concurrency: Option<u32>,
    max_retries: Option<u32>,
    retry_base_seconds: Option<u64>,
    retry_max_seconds: Option<u64>,
    lease_seconds: Option<u64>,
    reaper_schedule: Option<String>,
    embedded_workers: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSandboxSettings {
    runtime: Option<SandboxRuntime>,
    converter_path: Option<PathBuf>,
    docker_binary: Option<PathBuf>,
    image: Option<String>,
    timeout_seconds: Option<u64>,
    max_log_bytes: Option<u64>,
    memory_limit_mb: Option<u64>,
    cpu_limit: Option<f64>,
    cpu_seconds: Option<u64>,
    max_unpacked_bytes: Option<u64>,
    workspace_root: Option<PathBuf>,
    verbose: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSourceSettings {
    endpoint: Option<String>,
    verify_checksum: Option<bool>,
    token: Option<String>,
    timeout_seconds: Option<u64>,
    max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawArtifactSettings {
    directory: Option<PathBuf>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_secs(value: u64, key: &'static str) -> Result<u64, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_raw() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.backend.kind = Some(BackendKind::Memory);
        raw
    }

    #[test]
    fn defaults_are_applied() {
        let settings = Settings::from_raw(memory_raw()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.jobs.worker_concurrency.get(), 2);
        assert_eq!(settings.jobs.max_retries, 3);
        assert_eq!(settings.jobs.lease, Duration::from_secs(60));
        assert!(settings.jobs.embedded_workers);
        assert_eq!(settings.sandbox.runtime, SandboxRuntime::Container);
        assert_eq!(settings.sandbox.timeout, Duration::from_secs(600));
        assert_eq!(settings.sandbox.max_log_bytes, 1024 * 1024);
        assert!(settings.source.verify_checksum);
        assert_eq!(settings.source.max_bytes.get(), 256 * 1024 * 1024);
        assert_eq!(settings.sandbox.max_unpacked_bytes.get(), 1024 * 1024 * 1024);
        assert_eq!(settings.artifacts.directory, PathBuf::from("artifacts"));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = memory_raw();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.sandbox.runtime = Some(SandboxRuntime::Container);

        let overrides = ServeOverrides {
            server_port: Some(4321),
            runtime: RuntimeOverrides {
                log_level: Some("debug".to_string()),
                sandbox_runtime: Some(SandboxRuntime::Process),
                ..Default::default()
            },
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.sandbox.runtime, SandboxRuntime::Process);
    }

    #[test]
    fn postgres_backend_requires_a_database_url() {
        let err = Settings::from_raw(RawSettings::default()).expect_err("missing url");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "database.url",
                ..
            }
        ));

        let mut raw = RawSettings::default();
        raw.database.url = Some("postgres://localhost/texcompiler".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.backend, BackendKind::Postgres);
    }

    #[test]
    fn retry_ceiling_must_cover_the_base_delay() {
        let mut raw = memory_raw();
        raw.jobs.retry_base_seconds = Some(60);
        raw.jobs.retry_max_seconds = Some(10);

        let err = Settings::from_raw(raw).expect_err("invalid retry window");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "jobs.retry_max_seconds",
                ..
            }
        ));
    }

    #[test]
    fn invalid_reaper_schedule_is_rejected() {
        let mut raw = memory_raw();
        raw.jobs.reaper_schedule = Some("whenever".to_string());

        let err = Settings::from_raw(raw).expect_err("invalid schedule");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "jobs.reaper_schedule",
                ..
            }
        ));
    }

    #[test]
    fn zero_size_limits_are_rejected() {
        let mut raw = memory_raw();
        raw.source.max_bytes = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero source limit");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "source.max_bytes",
                ..
            }
        ));

        let mut raw = memory_raw();
        raw.sandbox.max_unpacked_bytes = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero unpack limit");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "sandbox.max_unpacked_bytes",
                ..
            }
        ));
    }

    #[test]
    fn source_endpoint_must_be_http() {
        let mut raw = memory_raw();
        raw.source.endpoint = Some("ftp://files.example".to_string());
        assert!(Settings::from_raw(raw).is_err());

        let mut raw = memory_raw();
        raw.source.endpoint = Some("https://files.example/api/".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.source.endpoint, "https://files.example/api");
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["texcompiler"]);
        let command = args
            .command
            .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
        assert!(matches!(command, Command::Serve(_)));
    }

    #[test]
    fn parse_serve_overrides() {
        let args = CliArgs::parse_from([
            "texcompiler",
            "serve",
            "--server-host",
            "0.0.0.0",
            "--backend",
            "memory",
            "--sandbox-runtime",
            "process",
            "--jobs-embedded-workers",
            "false",
        ]);

        match args.command.expect("serve command") {
            Command::Serve(serve) => {
                assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
                assert_eq!(serve.overrides.runtime.backend, Some(BackendKind::Memory));
                assert_eq!(
                    serve.overrides.runtime.sandbox_runtime,
                    Some(SandboxRuntime::Process)
                );
                assert_eq!(serve.overrides.jobs_embedded_workers, Some(false));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_worker_arguments() {
        let args = CliArgs::parse_from([
            "texcompiler",
            "worker",
            "--database-url",
            "postgres://example",
            "--jobs-worker-concurrency",
            "8",
        ]);

        match args.command.expect("worker command") {
            Command::Worker(worker) => {
                assert_eq!(
                    worker.overrides.database_url.as_deref(),
                    Some("postgres://example")
                );
                assert_eq!(worker.overrides.jobs_worker_concurrency, Some(8));
            }
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_migrate_arguments() {
        let args = CliArgs::parse_from([
            "texcompiler",
            "migrate",
            "--database-url",
            "postgres://example",
        ]);

        match args.command.expect("migrate command") {
            Command::Migrate(migrate) => {
                assert_eq!(
                    migrate.database.database_url.as_deref(),
                    Some("postgres://example")
                );
            }
            _ => panic!("wrong command parsed"),
        }
    }
}
