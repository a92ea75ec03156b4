use std::{process, sync::Arc, time::Duration};

use apalis::{
    layers::WorkerBuilderExt,
    prelude::{Monitor, WorkerBuilder, WorkerFactoryFn},
};
use apalis_cron::CronStream;
use apalis_sql::{Config as ApalisSqlConfig, postgres::PostgresStorage};
use texcompiler::{
    application::{
        artifacts::ArtifactStore,
        error::AppError,
        jobs::{
            CompileJobPayload, JobWorkerContext, LocalWorkerPool, process_compile_job,
            process_reap_leases_job, reap_schedule,
        },
        repos::TaskStore,
        status::StatusResolver,
        submission::SubmissionService,
        worker::{CompileWorker, LeaseReaper, RetryPolicy, WorkerSettings},
    },
    config::{self, BackendKind},
    domain::types::JobType,
    infra::{
        artifacts::FilesystemArtifactStore,
        db::PostgresRepositories,
        error::InfraError,
        fetcher::HttpSourceFetcher,
        http::{self, ApiState},
        memory::InMemoryTaskStore,
        sandbox::CommandSandbox,
        telemetry,
    },
};
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Worker(_) => run_worker(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    match settings.backend {
        BackendKind::Postgres => {
            let (http_repositories, job_repositories) = init_repositories(&settings).await?;
            let pipeline = build_pipeline(&settings, job_repositories.clone())?;
            let api_state = build_api_state(http_repositories, pipeline.artifacts.clone());

            let monitor_handle = if settings.jobs.embedded_workers {
                Some(spawn_job_monitor(
                    job_repositories,
                    pipeline.job_context(),
                    &settings.jobs,
                )?)
            } else {
                info!(
                    target = "texcompiler::serve",
                    "Embedded workers disabled; run `texcompiler worker` separately"
                );
                None
            };

            let result = serve_http(&settings, api_state).await;

            if let Some(handle) = monitor_handle {
                handle.abort();
                let _ = handle.await;
            }
            result
        }
        BackendKind::Memory => {
            if !settings.jobs.embedded_workers {
                warn!(
                    target = "texcompiler::serve",
                    "The memory backend always runs workers in-process"
                );
            }

            let (store, receiver) = InMemoryTaskStore::new();
            let store: Arc<dyn TaskStore> = Arc::new(store);
            let pipeline = build_pipeline(&settings, store.clone())?;
            let api_state = build_api_state(store, pipeline.artifacts.clone());

            let concurrency = settings.jobs.worker_concurrency.get() as usize;
            let pool = LocalWorkerPool::new(pipeline.worker.clone(), concurrency);
            let pool_handle = tokio::spawn(pool.run(receiver));
            let reaper_handle = spawn_interval_reaper(pipeline.reaper.clone(), settings.jobs.lease);

            let result = serve_http(&settings, api_state).await;

            for handle in [pool_handle, reaper_handle] {
                handle.abort();
                let _ = handle.await;
            }
            result
        }
    }
}

async fn run_worker(settings: config::Settings) -> Result<(), AppError> {
    if settings.backend == BackendKind::Memory {
        return Err(AppError::validation(
            "the worker command requires the postgres backend; the memory backend runs workers inside `serve`",
        ));
    }

    let (_, job_repositories) = init_repositories(&settings).await?;
    let pipeline = build_pipeline(&settings, job_repositories.clone())?;
    let mut monitor_handle =
        spawn_job_monitor(job_repositories, pipeline.job_context(), &settings.jobs)?;

    info!(
        target = "texcompiler::worker",
        worker_id = pipeline.worker.worker_id(),
        concurrency = settings.jobs.worker_concurrency.get(),
        "Worker started"
    );

    tokio::select! {
        _ = &mut monitor_handle => {
            return Err(AppError::unexpected("job monitor stopped unexpectedly"));
        }
        _ = shutdown_signal() => {
            info!(target = "texcompiler::worker", "Shutdown requested");
        }
    }

    monitor_handle.abort();
    let _ = monitor_handle.await;
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let database_url = settings.database.url.as_deref().ok_or_else(|| {
        AppError::validation(
            "database url is required (provide --database-url or set TEXCOMPILER__DATABASE__URL)",
        )
    })?;

    let pool = PostgresRepositories::connect(database_url, 1)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::migration(err.to_string())))?;

    info!(target = "texcompiler::migrate", "Migrations applied");
    Ok(())
}

/// Everything needed to execute tasks, independent of the backend holding them.
struct Pipeline {
    artifacts: Arc<dyn ArtifactStore>,
    worker: Arc<CompileWorker>,
    reaper: Arc<LeaseReaper>,
}

impl Pipeline {
    fn job_context(&self) -> JobWorkerContext {
        JobWorkerContext {
            worker: self.worker.clone(),
            reaper: self.reaper.clone(),
        }
    }
}

fn build_pipeline(
    settings: &config::Settings,
    store: Arc<dyn TaskStore>,
) -> Result<Pipeline, AppError> {
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(
        FilesystemArtifactStore::new(settings.artifacts.directory.clone())
            .map_err(|err| AppError::from(InfraError::from(err)))?,
    );
    let fetcher = Arc::new(HttpSourceFetcher::new(&settings.source).map_err(AppError::from)?);
    let sandbox = Arc::new(CommandSandbox::new(&settings.sandbox));

    let retry = RetryPolicy {
        max_retries: settings.jobs.max_retries,
        base: settings.jobs.retry_base,
        max: settings.jobs.retry_max,
    };
    let worker_settings = WorkerSettings {
        lease: settings.jobs.lease,
        execution_timeout: settings.sandbox.timeout,
        retry,
    };

    let worker = Arc::new(CompileWorker::new(
        worker_id(),
        store.clone(),
        artifacts.clone(),
        sandbox,
        fetcher,
        worker_settings,
    ));
    let reaper = Arc::new(LeaseReaper::new(store, retry));

    Ok(Pipeline {
        artifacts,
        worker,
        reaper,
    })
}

fn build_api_state(store: Arc<dyn TaskStore>, artifacts: Arc<dyn ArtifactStore>) -> ApiState {
    ApiState {
        submissions: Arc::new(SubmissionService::new(store.clone())),
        status: Arc::new(StatusResolver::new(store, artifacts)),
    }
}

fn worker_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", process::id(), &suffix[..8])
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<(Arc<PostgresRepositories>, Arc<PostgresRepositories>), AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let http_pool =
        PostgresRepositories::connect(database_url, settings.database.http_max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PostgresRepositories::run_migrations(&http_pool)
        .await
        .map_err(|err| AppError::from(InfraError::migration(err.to_string())))?;

    let jobs_pool =
        PostgresRepositories::connect(database_url, settings.database.jobs_max_connections.get())
            .await
            .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok((
        Arc::new(PostgresRepositories::new(http_pool)),
        Arc::new(PostgresRepositories::new(jobs_pool)),
    ))
}

fn spawn_job_monitor(
    repositories: Arc<PostgresRepositories>,
    context: JobWorkerContext,
    jobs: &config::JobsSettings,
) -> Result<JoinHandle<()>, AppError> {
    let compile_storage: PostgresStorage<CompileJobPayload> = PostgresStorage::new_with_config(
        repositories.pool().clone(),
        ApalisSqlConfig::new(JobType::Compile.as_str()),
    );
    let schedule = reap_schedule(&jobs.reaper_schedule)
        .map_err(|err| AppError::validation(err.to_string()))?;

    let compile_worker = WorkerBuilder::new("compile-worker")
        .concurrency(jobs.worker_concurrency.get() as usize)
        .data(context.clone())
        .backend(compile_storage)
        .build_fn(process_compile_job);
    let reaper_worker = WorkerBuilder::new("lease-reaper")
        .data(context)
        .backend(CronStream::new(schedule))
        .build_fn(process_reap_leases_job);

    let monitor = Monitor::new()
        .register(compile_worker)
        .register(reaper_worker);

    Ok(tokio::spawn(async move {
        if let Err(err) = monitor.run().await {
            error!(error = %err, "job monitor stopped");
        }
    }))
}

/// Memory mode has no cron backend; sweep on a fixed period instead.
fn spawn_interval_reaper(reaper: Arc<LeaseReaper>, lease: Duration) -> JoinHandle<()> {
    let period = (lease / 2).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match reaper.sweep(OffsetDateTime::now_utc()).await {
                Ok(0) => {}
                Ok(count) => info!(
                    target = "texcompiler::jobs::reap",
                    reaped = count,
                    "Reaped expired leases"
                ),
                Err(err) => warn!(
                    target = "texcompiler::jobs::reap",
                    error = %err,
                    "Failed to reap expired leases"
                ),
            }
        }
    })
}

async fn serve_http(settings: &config::Settings, api_state: ApiState) -> Result<(), AppError> {
    let router = http::build_router(api_state);
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "texcompiler::http",
        addr = %settings.server.addr,
        "HTTP server listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service()).with_graceful_shutdown(
        async move {
            let _ = shutdown_rx.await;
        },
    );
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        joined = &mut server => return server_result(joined),
        _ = shutdown_signal() => {}
    }

    info!(
        target = "texcompiler::http",
        grace_seconds = settings.server.graceful_shutdown.as_secs(),
        "Shutting down HTTP server"
    );
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_result(joined),
        Err(_) => {
            warn!(
                target = "texcompiler::http",
                "Graceful shutdown timed out; dropping open connections"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
