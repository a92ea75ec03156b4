use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use texcompiler_api_types::{ApiErrorBody, ApiErrorMessage};

use crate::application::error::ErrorReport;

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INVALID_FORMAT: &str = "invalid_format";
    pub const NOT_FOUND: &str = "not_found";
    pub const ALREADY_IN_FLIGHT: &str = "already_in_flight";
    pub const NOT_READY: &str = "not_ready";
    pub const REPO: &str = "repo_error";
    pub const STORAGE: &str = "storage_error";
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn invalid_format(hint: String) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            codes::INVALID_FORMAT,
            "Unsupported output format",
            Some(hint),
        )
    }

    pub fn not_found(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, hint)
    }

    pub fn not_ready(hint: String) -> Self {
        Self::new(
            StatusCode::CONFLICT,
            codes::NOT_READY,
            "Task has not completed",
            Some(hint),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let hint = self.hint.clone();
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        ErrorReport::from_message(
            "infra::http::api",
            self.status,
            format!("{}: {}", self.code, hint.as_deref().unwrap_or(self.message)),
        )
        .attach(&mut response);
        response
    }
}
