use axum::{
    extract::{Json, Multipart, Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::{
    error::PipelineError,
    pipeline::{SubmitOutcome, SubmitRequest},
    queue::{ConversionJob, JobState},
    state::AppState,
    upload::{stage_submission, UploadError},
};

#[derive(Debug, Serialize)]
struct JobStatusBody {
    #[serde(rename = "jobId")]
    job_id: String,
    #[serde(rename = "userId")]
    user_id: i64,
    #[serde(rename = "fileName")]
    file_name: String,
    state: JobState,
    terminal: bool,
    attempts: u32,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
}

impl From<ConversionJob> for JobStatusBody {
    fn from(job: ConversionJob) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            file_name: job.file_name,
            state: job.state,
            terminal: job.state.is_terminal(),
            attempts: job.attempts,
            last_error: job.last_error,
            created_at: job.created_at,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Response {
    if let Err(error) = state.store.ping().await {
        tracing::error!(error = %error, "database health check failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "database": error.to_string() })),
        )
            .into_response();
    }

    match state.queue().depth().await {
        Ok(depth) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok", "queue": depth })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to read queue depth");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "database": error.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

pub async fn submit_document(State(state): State<AppState>, multipart: Multipart) -> Response {
    let staged = match stage_submission(
        multipart,
        &state.config.upload_dir,
        state.config.max_upload_bytes,
    )
    .await
    {
        Ok(staged) => staged,
        Err(error) => return upload_error_to_response(error),
    };

    let request = SubmitRequest {
        user_id: staged.user_id,
        artifact: staged.staged_path,
        file_name: staged.original_name,
        password: staged.password,
    };

    match state.pipeline.submit(request).await {
        Ok(SubmitOutcome::Accepted { job_id, tier }) => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "accepted", "jobId": job_id, "tier": tier })),
        )
            .into_response(),
        Ok(SubmitOutcome::Rejected(reason)) => (
            StatusCode::OK,
            Json(json!({ "status": "rejected", "reason": reason })),
        )
            .into_response(),
        Err(error) => pipeline_error_to_response(error),
    }
}

pub async fn get_job(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.queue().get(&id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobStatusBody::from(job))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Job not found" })),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(job_id = %id, error = %error, "failed to load job");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "error": "Job store unavailable" })),
            )
                .into_response()
        }
    }
}

fn upload_error_to_response(error: UploadError) -> Response {
    match error {
        UploadError::MissingFile | UploadError::MissingUserId | UploadError::InvalidUserId => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": error.to_string() })),
        )
            .into_response(),
        UploadError::FileTooLarge => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({ "error": "File exceeds upload limit" })),
        )
            .into_response(),
        UploadError::MultipartError => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Failed to parse upload" })),
        )
            .into_response(),
        UploadError::IoError => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Failed to persist upload" })),
        )
            .into_response(),
    }
}

fn pipeline_error_to_response(error: PipelineError) -> Response {
    let message = match error {
        PipelineError::Ledger(_) | PipelineError::Queue(_) => "Conversion service unavailable.",
        PipelineError::UserLookup(_) => "User directory unavailable.",
        PipelineError::Artifact(_) => "Failed to read uploaded file.",
    };
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": message })),
    )
        .into_response()
}
