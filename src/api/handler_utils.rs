use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::api::error::ErrorKind;
use crate::db::jobs::JobStoreError;
use crate::pipeline::service::CreateJobError;

pub type ApiObject<T> = (StatusCode, Json<T>);

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
}

pub fn error_response(
    status: StatusCode,
    kind: ErrorKind,
    code: impl Into<String>,
    message: impl Into<String>,
) -> ApiObject<Value> {
    (
        status,
        into_json(ErrorResponse {
            ok: false,
            error: message.into(),
            error_kind: Some(kind),
            error_code: Some(code.into()),
        }),
    )
}

pub fn map_store_error(error: JobStoreError, not_found_message: &str) -> ApiObject<Value> {
    match error {
        JobStoreError::NotFound => error_response(
            StatusCode::NOT_FOUND,
            ErrorKind::Validation,
            "not_found",
            not_found_message,
        ),
        JobStoreError::Validation(message) => error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            message,
        ),
        JobStoreError::AdmissionRejected { in_flight, ceiling } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Ledger,
            "active_job_limit",
            format!("Active job limit reached ({in_flight} of {ceiling} in flight)"),
        ),
        JobStoreError::InsufficientBalance { needed, remaining } => error_response(
            StatusCode::CONFLICT,
            ErrorKind::Ledger,
            "insufficient_tokens",
            format!("Insufficient token balance: need {needed}, have {remaining}"),
        ),
        JobStoreError::Sqlite(source) => internal_error(format!("database error: {source}")),
    }
}

pub fn map_create_error(error: CreateJobError) -> ApiObject<Value> {
    match error {
        CreateJobError::InvalidRequest(message) => error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            message,
        ),
        CreateJobError::AdmissionRejected { in_flight, ceiling } => error_response(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Ledger,
            "active_job_limit",
            format!("Active job limit reached ({in_flight} of {ceiling} in flight)"),
        ),
        CreateJobError::InsufficientBalance { needed, remaining } => error_response(
            StatusCode::CONFLICT,
            ErrorKind::Ledger,
            "insufficient_tokens",
            format!("Insufficient token balance: need {needed}, have {remaining}"),
        ),
        CreateJobError::Staging(message) => internal_error(format!("input staging failed: {message}")),
        CreateJobError::Store(source) => map_store_error(source, "Job not found"),
    }
}

pub fn internal_error(message: impl Into<String>) -> ApiObject<Value> {
    let detail = message.into();
    error!(detail = %detail, "internal api error");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Infra,
        "internal_error",
        "Internal server error",
    )
}

pub fn into_json(payload: impl Serialize) -> Json<Value> {
    Json(serde_json::to_value(payload).expect("api payload should serialize"))
}
