//! Owner API endpoints
//!
//! Note publishing and delivery job inspection.
//! All routes require the owner token.

use std::collections::BTreeMap;

use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};

use crate::AppState;
use crate::api::converters::{job_to_response, note_to_response, published_to_response};
use crate::api::dto::*;
use crate::auth::Owner;
use crate::data::JobState;
use crate::error::AppError;

const DEFAULT_JOB_LIMIT: u32 = 100;
const MAX_JOB_LIMIT: u32 = 1000;

/// Create owner API router
///
/// Routes:
/// - POST /api/note - Publish a note
/// - GET /api/note/:id - Get a note
/// - DELETE /api/note/:id - Delete a note and cancel its deliveries
/// - GET /api/jobs - List delivery jobs, optionally by state
/// - GET /api/jobs/stats - Job counts per state
pub fn admin_router() -> Router<AppState> {
    Router::new()
        // Notes
        .route("/note", post(create_note))
        .route("/note/:id", get(get_note).delete(delete_note))
        // Delivery jobs
        .route("/jobs", get(list_jobs))
        .route("/jobs/stats", get(job_stats))
}

// =============================================================================
// Notes
// =============================================================================

/// POST /api/note
///
/// Stores the note and enqueues its Create activity for every follower.
async fn create_note(
    State(state): State<AppState>,
    _owner: Owner,
    Json(request): Json<CreateNoteRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let published = state.notes.create(request.content).await?;
    let response = published_to_response(&published, &state.config.actor_url());
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/note/:id
async fn get_note(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<NoteResponse>, AppError> {
    let note = state.notes.get(&id).await?;
    Ok(Json(note_to_response(&note, &state.config.actor_url())))
}

/// DELETE /api/note/:id
///
/// Pending and in-flight deliveries of the note are marked dead.
async fn delete_note(
    State(state): State<AppState>,
    _owner: Owner,
    Path(id): Path<String>,
) -> Result<Json<DeleteNoteResponse>, AppError> {
    let cancelled_jobs = state.notes.delete(&id).await?;
    Ok(Json(DeleteNoteResponse { id, cancelled_jobs }))
}

// =============================================================================
// Delivery jobs
// =============================================================================

/// GET /api/jobs?state=dead&limit=50
async fn list_jobs(
    State(state): State<AppState>,
    _owner: Owner,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let job_state = query
        .state
        .as_deref()
        .map(str::parse::<JobState>)
        .transpose()
        .map_err(AppError::Validation)?;
    let limit = query.limit.unwrap_or(DEFAULT_JOB_LIMIT).clamp(1, MAX_JOB_LIMIT);

    let jobs = state.db.list_jobs(job_state, limit).await?;
    Ok(Json(jobs.iter().map(job_to_response).collect()))
}

/// GET /api/jobs/stats
///
/// Returns `{"pending": n, "in_flight": n, "succeeded": n, "dead": n}`.
async fn job_stats(
    State(state): State<AppState>,
    _owner: Owner,
) -> Result<Json<BTreeMap<String, i64>>, AppError> {
    let counts = state.db.count_jobs_by_state().await?;
    Ok(Json(
        counts
            .into_iter()
            .map(|(job_state, count)| (job_state.as_str().to_string(), count))
            .collect(),
    ))
}
