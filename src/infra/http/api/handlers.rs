use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use texcompiler_api_types::{SubmitRequest, TaskStatusResponse};

use crate::application::artifacts::StorageError;
use crate::application::error::ErrorReport;
use crate::application::repos::RepoError;
use crate::application::status::ResolveError;
use crate::application::submission::SubmitError;
use crate::domain::entities::CompilationTask;
use crate::domain::error::CompileError;
use crate::domain::task::TaskKey;
use crate::domain::types::OutputFormat;

use super::error::{ApiError, codes};
use super::models::{HealthResponse, TaskPath};
use super::state::ApiState;

/// -------- Submission --------
pub async fn submit(
    State(state): State<ApiState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|err| ApiError::bad_request("Invalid request body", Some(err.body_text())))?;

    let submission = state
        .submissions
        .submit(request.into())
        .await
        .map_err(submit_to_api)?;

    let status = if submission.accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CONFLICT
    };
    let mut response = task_response(status, &submission.task);

    if let Some(conflict) = submission.conflict() {
        ErrorReport::from_message(
            "infra::http::api::submit",
            status,
            format!("{}: {conflict}", codes::ALREADY_IN_FLIGHT),
        )
        .attach(&mut response);
    }
    Ok(response)
}

/// -------- Status --------
pub async fn get_status(
    State(state): State<ApiState>,
    Path(path): Path<TaskPath>,
) -> Result<Response, ApiError> {
    let key = task_key(path)?;
    let task = state.status.resolve(&key).await.map_err(resolve_to_api)?;
    Ok(task_response(StatusCode::OK, &task))
}

pub async fn get_content(
    State(state): State<ApiState>,
    Path(path): Path<TaskPath>,
) -> Result<Response, ApiError> {
    let key = task_key(path)?;
    let (_, bytes) = state.status.artifact(&key).await.map_err(resolve_to_api)?;

    let format = key.output_format();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    if let Ok(etag) = HeaderValue::from_str(key.checksum()) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(disposition) = HeaderValue::from_str(&content_disposition(&key, format)) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    Ok((StatusCode::OK, headers, bytes).into_response())
}

pub async fn get_log(
    State(state): State<ApiState>,
    Path(path): Path<TaskPath>,
) -> Result<Response, ApiError> {
    let key = task_key(path)?;
    let (_, bytes) = state.status.log(&key).await.map_err(resolve_to_api)?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        )],
        bytes,
    )
        .into_response())
}

/// -------- Health --------
pub async fn health(State(state): State<ApiState>) -> Response {
    match state.status.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
            }),
        )
            .into_response(),
        Err(err) => {
            let mut response = (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable".to_string(),
                }),
            )
                .into_response();
            ErrorReport::from_error(
                "infra::http::api::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}

fn task_response(status: StatusCode, task: &CompilationTask) -> Response {
    let mut response = (status, Json(TaskStatusResponse::from(task))).into_response();
    if let Ok(location) = HeaderValue::from_str(&task.key.location()) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

fn task_key(path: TaskPath) -> Result<TaskKey, ApiError> {
    let format = path
        .format
        .parse::<OutputFormat>()
        .map_err(|err| ApiError::invalid_format(err.to_string()))?;
    TaskKey::new(path.source_id, path.checksum, format)
        .map_err(|err| ApiError::bad_request("Invalid task key", Some(err.to_string())))
}

fn content_disposition(key: &TaskKey, format: OutputFormat) -> String {
    let stem = key.source_id().replace(['"', '\\'], "_");
    format!("attachment; filename=\"{stem}.{}\"", format.extension())
}

fn submit_to_api(err: SubmitError) -> ApiError {
    match err {
        SubmitError::Compile(CompileError::InvalidFormat(unknown)) => {
            ApiError::invalid_format(unknown.to_string())
        }
        SubmitError::Compile(other) => {
            ApiError::bad_request("Invalid submission", Some(other.to_string()))
        }
        SubmitError::Validation(domain) => {
            ApiError::bad_request("Invalid submission", Some(domain.to_string()))
        }
        SubmitError::Repo(repo) => repo_to_api(repo),
    }
}

fn resolve_to_api(err: ResolveError) -> ApiError {
    match err {
        ResolveError::NotFound { task_id } => ApiError::not_found("Task not found", Some(task_id)),
        ResolveError::NotReady { task_id, status } => {
            ApiError::not_ready(format!("task `{task_id}` is {status}"))
        }
        ResolveError::LogMissing { task_id } => {
            ApiError::not_found("Log not available", Some(task_id))
        }
        ResolveError::Repo(repo) => repo_to_api(repo),
        ResolveError::Storage(storage) => storage_to_api(storage),
    }
}

fn repo_to_api(err: RepoError) -> ApiError {
    match err {
        RepoError::InvalidInput { message } => {
            ApiError::bad_request("Invalid input", Some(message))
        }
        RepoError::NotFound => ApiError::not_found("Task not found", None),
        RepoError::Timeout => ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            codes::REPO,
            "Task store timed out",
            None,
        ),
        other => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            codes::REPO,
            "Task store error",
            Some(other.to_string()),
        ),
    }
}

fn storage_to_api(err: StorageError) -> ApiError {
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        codes::STORAGE,
        "Artifact storage error",
        Some(err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TaskStatus;

    #[test]
    fn content_disposition_names_file_after_source() {
        let key = TaskKey::new("hep-th9901001", "abc", OutputFormat::Ps).expect("key");
        assert_eq!(
            content_disposition(&key, OutputFormat::Ps),
            "attachment; filename=\"hep-th9901001.ps\""
        );
    }

    #[test]
    fn resolve_errors_map_to_stable_codes() {
        let not_ready = resolve_to_api(ResolveError::NotReady {
            task_id: "x".to_string(),
            status: TaskStatus::Queued,
        });
        assert_eq!(not_ready.status(), StatusCode::CONFLICT);
        assert_eq!(not_ready.code(), codes::NOT_READY);

        let missing = resolve_to_api(ResolveError::NotFound {
            task_id: "x".to_string(),
        });
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(missing.code(), codes::NOT_FOUND);

        let storage = resolve_to_api(ResolveError::Storage(StorageError::NotFound {
            key: "k".to_string(),
        }));
        assert_eq!(storage.code(), codes::STORAGE);
    }

    #[test]
    fn bad_format_in_path_is_invalid_format() {
        let err = task_key(TaskPath {
            source_id: "1902.00123".to_string(),
            checksum: "abc".to_string(),
            format: "html".to_string(),
        })
        .expect_err("invalid");
        assert_eq!(err.code(), codes::INVALID_FORMAT);
    }
}
