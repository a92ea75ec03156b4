#![deny(clippy::all, clippy::pedantic)]

use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use texcompiler_api_types::{ApiErrorBody, TaskStatus, encode_task_path};
use thiserror::Error;

use crate::args::{Cli, TaskArgs};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("server URL is required (use --server or TEXCOMPILER_URL)")]
    MissingServer,
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: [{code}] {message}")]
    Server {
        status: StatusCode,
        code: String,
        message: String,
    },
    #[error("failed to write {path}: {source}")]
    OutputFile {
        path: String,
        source: std::io::Error,
    },
    #[error("task {task_id} still {status} after {seconds}s")]
    TimedOut {
        task_id: String,
        status: TaskStatus,
        seconds: u64,
    },
    #[error("task {task_id} finished as {status}")]
    Unsuccessful { task_id: String, status: TaskStatus },
    #[error("{0}")]
    Render(String),
}

#[derive(Clone, Debug)]
pub struct Ctx {
    pub client: Client,
    pub base: Url,
}

impl Ctx {
    pub fn new(server: &str) -> Result<Self, CliError> {
        let mut base = Url::parse(server)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self { client, base })
    }

    pub fn user_agent() -> &'static str {
        concat!("texcompiler-cli/", env!("CARGO_PKG_VERSION"))
    }

    /// Resolve a service path against the base URL, keeping any base path prefix.
    pub fn url(&self, path: &str) -> Result<Url, CliError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(CliError::Url)
    }

    pub fn task_url(&self, task: &TaskArgs, suffix: &str) -> Result<Url, CliError> {
        let path = encode_task_path(&task.source_id, &task.checksum, task.format.format());
        self.url(&format!("{path}{suffix}"))
    }

    /// Send a JSON request. Returns the status alongside the body so callers can
    /// treat documented non-2xx answers (such as 409 on resubmission) as data.
    pub async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        accept: &[StatusCode],
    ) -> Result<(StatusCode, T), CliError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self.client.request(method, url);
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() && !accept.contains(&status) {
            return Err(Self::server_error(resp).await);
        }
        let bytes = resp.bytes().await?;
        let val = serde_json::from_slice(&bytes)
            .map_err(|e| CliError::Render(format!("failed to parse body: {e}")))?;
        Ok((status, val))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, CliError> {
        let (_, val) = self.send_json::<(), T>(Method::GET, url, None, &[]).await?;
        Ok(val)
    }

    pub async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, CliError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(Self::server_error(resp).await);
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn server_error(resp: Response) -> CliError {
        let status = resp.status();
        let bytes = resp.bytes().await.unwrap_or_default();
        match serde_json::from_slice::<ApiErrorBody>(&bytes) {
            Ok(body) => CliError::Server {
                status,
                code: body.error.code,
                message: body.error.message,
            },
            Err(_) => CliError::Server {
                status,
                code: "unknown".to_string(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            },
        }
    }
}

pub fn build_ctx_from_cli(cli: &Cli) -> Result<Ctx, CliError> {
    let server = cli.server.as_deref().ok_or(CliError::MissingServer)?;
    Ctx::new(server)
}
