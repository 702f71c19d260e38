use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::error::ErrorKind;
use crate::api::server::AppState;
use crate::db::jobs::{JobKind, JobRecord, JobStatus};
use crate::pipeline::service::{CancelRejection, CreateJobInput};

use super::handler_utils::{
    error_response, internal_error, into_json, map_create_error, map_store_error, ApiObject,
};

const DEFAULT_HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateJobRequest {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub input_url: Option<String>,
    #[serde(default)]
    pub input_b64: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelJobRequest {
    #[serde(default)]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CreateJobResponse {
    ok: bool,
    job: JobRecord,
    remaining_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
struct JobDetailResponse {
    ok: bool,
    job: JobRecord,
}

#[derive(Debug, Clone, Serialize)]
struct ListJobsResponse {
    ok: bool,
    count: usize,
    total: i64,
    has_more: bool,
    jobs: Vec<JobRecord>,
}

#[derive(Debug, Clone, Serialize)]
struct CancelJobResponse {
    ok: bool,
    cancelled: bool,
    refunded: bool,
    status: JobStatus,
}

pub async fn create_job_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> ApiObject<Value> {
    let Some(owner_id) = non_empty(body.owner_id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            "Field 'owner_id' is required",
        );
    };
    let kind_raw = body.kind.unwrap_or_default();
    let Some(kind) = JobKind::parse(kind_raw.as_str()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            "Field 'kind' must be one of: generate, modify, enhance",
        );
    };

    let service = state.service.clone();
    let input = CreateJobInput {
        owner_id,
        kind,
        prompt: body.prompt.unwrap_or_default(),
        input_url: body.input_url,
        input_b64: body.input_b64,
    };
    let result = tokio::task::spawn_blocking(move || service.create_job(input)).await;

    match result {
        Ok(Ok(created)) => {
            // Execution is detached on purpose: the response returns as soon
            // as the job is admitted and charged, and the runner owns the
            // outcome from here.
            let runner = state.runner.clone();
            let job_id = created.job.id.clone();
            drop(tokio::task::spawn_blocking(move || {
                runner.execute(job_id.as_str())
            }));

            (
                StatusCode::CREATED,
                into_json(CreateJobResponse {
                    ok: true,
                    job: created.job,
                    remaining_tokens: created.remaining_tokens,
                }),
            )
        }
        Ok(Err(error)) => map_create_error(error),
        Err(join_error) => internal_error(format!("job creation task failed: {join_error}")),
    }
}

pub async fn get_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiObject<Value> {
    let service = state.service.clone();
    let owner = non_empty(query.owner_id);
    let result = tokio::task::spawn_blocking(move || {
        service.get_job(job_id.as_str(), owner.as_deref())
    })
    .await;

    match result {
        Ok(Ok(job)) => (
            StatusCode::OK,
            into_json(JobDetailResponse { ok: true, job }),
        ),
        Ok(Err(error)) => map_store_error(error, "Job not found"),
        Err(join_error) => internal_error(format!("job lookup task failed: {join_error}")),
    }
}

pub async fn list_jobs_handler(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> ApiObject<Value> {
    let Some(owner_id) = non_empty(query.owner_id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            "Query parameter 'owner_id' is required",
        );
    };
    let kind = match query.kind.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => None,
        Some(raw) => match JobKind::parse(raw) {
            Some(kind) => Some(kind),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorKind::Validation,
                    "validation_error",
                    "Query parameter 'kind' must be one of: generate, modify, enhance",
                );
            }
        },
    };

    let service = state.service.clone();
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0);
    let result = tokio::task::spawn_blocking(move || {
        service.job_history(owner_id.as_str(), limit, offset, kind)
    })
    .await;

    match result {
        Ok(Ok(page)) => (
            StatusCode::OK,
            into_json(ListJobsResponse {
                ok: true,
                count: page.jobs.len(),
                total: page.total,
                has_more: page.has_more,
                jobs: page.jobs,
            }),
        ),
        Ok(Err(error)) => map_store_error(error, "Owner not found"),
        Err(join_error) => internal_error(format!("job history task failed: {join_error}")),
    }
}

pub async fn cancel_job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Json(body): Json<CancelJobRequest>,
) -> ApiObject<Value> {
    let Some(owner_id) = non_empty(body.owner_id) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            ErrorKind::Validation,
            "validation_error",
            "Field 'owner_id' is required",
        );
    };

    let service = state.service.clone();
    let result = tokio::task::spawn_blocking(move || {
        service.cancel_job(job_id.as_str(), owner_id.as_str())
    })
    .await;

    match result {
        Ok(Ok(outcome)) => match outcome.rejection {
            None => (
                StatusCode::OK,
                into_json(CancelJobResponse {
                    ok: true,
                    cancelled: true,
                    refunded: outcome.refunded,
                    status: JobStatus::Cancelled,
                }),
            ),
            Some(CancelRejection::NotFound) => error_response(
                StatusCode::NOT_FOUND,
                ErrorKind::Validation,
                "not_found",
                "Job not found",
            ),
            Some(CancelRejection::Forbidden) => error_response(
                StatusCode::FORBIDDEN,
                ErrorKind::Validation,
                "forbidden",
                "Job belongs to a different owner",
            ),
            Some(CancelRejection::AlreadyTerminal(status)) => error_response(
                StatusCode::CONFLICT,
                ErrorKind::Validation,
                "already_terminal",
                format!("Job is already {}", status.as_str()),
            ),
        },
        Ok(Err(error)) => map_store_error(error, "Job not found"),
        Err(join_error) => internal_error(format!("job cancel task failed: {join_error}")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
