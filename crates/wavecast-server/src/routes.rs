use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use wavecast_core::job_queue::JobQueue;
use wavecast_core::traits::WaveStore;
use wavecast_core::{
    AppError, JobFilter, JobStatus, NewChannel, NewItem, RateBudget, Stage, WaveMemberRequest,
};

use crate::auth::require_admin_token;
use crate::dto::{
    AddWaveMembersRequest, ChannelListResponse, ChannelResponse, CreateChannelRequest,
    EligibilityResponse, FailItemRequest, HealthResponse, ItemDetailResponse, ItemResponse,
    JobListResponse, JobResponse, ListJobsQuery, OrchestratorStateResponse, ScheduleWaveRequest,
    SubmitItemRequest, SubmitItemResponse, UpdateScheduleRequest, WaveResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/items", post(submit_item))
        .route("/v1/items/{id}", get(get_item))
        .route("/v1/items/{id}/fail", post(fail_item))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/{id}", get(get_job))
        .route("/v1/jobs/{id}/retry", post(retry_job))
        .route("/v1/waves", post(schedule_wave))
        .route("/v1/waves/{id}", get(get_wave))
        .route("/v1/waves/{id}/members", post(add_wave_members))
        .route("/v1/channels", post(create_channel))
        .route("/v1/channels", get(list_channels))
        .route("/v1/channels/{id}/activate", post(activate_channel))
        .route("/v1/channels/{id}/deactivate", post(deactivate_channel))
        .route("/v1/channels/{id}/schedule", put(update_schedule))
        .route("/v1/channels/{id}/eligibility", get(channel_eligibility))
        .route("/v1/orchestrator", get(orchestrator_state))
        .route("/v1/orchestrator/pause", post(pause))
        .route("/v1/orchestrator/resume", post(resume))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/items",
    request_body = SubmitItemRequest,
    responses(
        (status = 202, description = "Item registered, Discovery job queued", body = SubmitItemResponse),
        (status = 400, description = "Bad request", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn submit_item(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<SubmitItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.source_ref.trim().is_empty() {
        return Err(AppError::InvalidInput("source_ref must not be empty".into()).into());
    }

    let item = NewItem::new(body.source_ref).with_channels(body.channel_ids);
    let (item, job) = state
        .operator()
        .submit_item(item, body.priority.unwrap_or(0))
        .await?;

    let response = SubmitItemResponse {
        item: item.into(),
        job: job.into(),
    };
    Ok((StatusCode::ACCEPTED, axum::Json(response)))
}

#[utoipa::path(
    get,
    path = "/v1/items/{id}",
    params(("id" = Uuid, Path, description = "Item ID")),
    responses(
        (status = 200, description = "Item with every job it spawned", body = ItemDetailResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state.operator().item_detail(id).await?;

    let response = ItemDetailResponse {
        item: detail.item.into(),
        jobs: detail.jobs.into_iter().map(JobResponse::from).collect(),
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/items/{id}/fail",
    params(("id" = Uuid, Path, description = "Item ID")),
    request_body = FailItemRequest,
    responses(
        (status = 200, description = "Item failed, queued jobs discarded", body = ItemResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Item already failed", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "items"
)]
pub async fn fail_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<FailItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.operator().mark_item_failed(id, &body.reason).await?;
    Ok(axum::Json(ItemResponse::from(item)))
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Jobs, newest first", body = JobListResponse),
        (status = 400, description = "Bad filter", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status: Option<JobStatus> = query
        .status
        .map(|s| s.parse().map_err(AppError::InvalidInput))
        .transpose()?;
    let stage: Option<Stage> = query
        .stage
        .map(|s| s.parse().map_err(AppError::InvalidInput))
        .transpose()?;

    let filter = JobFilter {
        status,
        stage,
        item_id: query.item_id,
        channel_id: query.channel_id,
        limit: query.limit.unwrap_or(20).min(100),
    };
    let jobs = state.db.job_repo().list_jobs(filter).await?;
    let total = jobs.len();

    let response = JobListResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
        total,
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    get,
    path = "/v1/jobs/{id}",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .db
        .job_repo()
        .get_job(id)
        .await?
        .ok_or_else(|| AppError::not_found("job", id))?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/retry",
    params(("id" = Uuid, Path, description = "Dead or discarded job ID")),
    responses(
        (status = 200, description = "Job re-queued with a fresh attempt budget", body = JobResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Job is neither dead nor discarded, or its key is taken", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "jobs"
)]
pub async fn retry_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.operator().retry_dead_job(id).await?;
    Ok(axum::Json(JobResponse::from(job)))
}

// ---------------------------------------------------------------------------
// Waves
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/waves",
    request_body = ScheduleWaveRequest,
    responses(
        (status = 201, description = "Wave scheduled", body = WaveResponse),
        (status = 404, description = "Unknown item or channel", body = crate::dto::ErrorResponse),
        (status = 409, description = "Member already publishing", body = crate::dto::ErrorResponse),
        (status = 422, description = "Target time not in the future", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "waves"
)]
pub async fn schedule_wave(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<ScheduleWaveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let members: Vec<WaveMemberRequest> = body.members.into_iter().map(Into::into).collect();
    let wave = state
        .operator()
        .schedule_wave(members, body.target_time, body.label)
        .await?;
    let status = state.db.wave_repo().wave_status(wave.id).await?;

    Ok((StatusCode::CREATED, axum::Json(WaveResponse::new(wave, status))))
}

#[utoipa::path(
    get,
    path = "/v1/waves/{id}",
    params(("id" = Uuid, Path, description = "Wave ID")),
    responses(
        (status = 200, description = "Wave with aggregated member status", body = WaveResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "waves"
)]
pub async fn get_wave(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let (wave, status) = state.operator().wave(id).await?;
    Ok(axum::Json(WaveResponse::new(wave, status)))
}

#[utoipa::path(
    post,
    path = "/v1/waves/{id}/members",
    params(("id" = Uuid, Path, description = "Wave ID")),
    request_body = AddWaveMembersRequest,
    responses(
        (status = 200, description = "Members added", body = WaveResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 409, description = "Wave closed", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "waves"
)]
pub async fn add_wave_members(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<AddWaveMembersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let members: Vec<WaveMemberRequest> = body.members.into_iter().map(Into::into).collect();
    let wave = state.operator().add_wave_members(id, members).await?;
    let status = state.db.wave_repo().wave_status(wave.id).await?;

    Ok(axum::Json(WaveResponse::new(wave, status)))
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/channels",
    request_body = CreateChannelRequest,
    responses(
        (status = 201, description = "Channel created (inactive)", body = ChannelResponse),
        (status = 400, description = "Bad request", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = NewChannel::new(body.name, body.credential_scope)
        .with_schedule(body.schedule)
        .with_rate_budget(body.rate_budget.map(Into::into).unwrap_or_default());
    let channel = state.channels().create_channel(channel).await?;

    Ok((StatusCode::CREATED, axum::Json(ChannelResponse::from(channel))))
}

#[utoipa::path(
    get,
    path = "/v1/channels",
    responses(
        (status = 200, description = "All channels", body = ChannelListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn list_channels(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let channels = state.channels().list_channels().await?;

    let response = ChannelListResponse {
        channels: channels.into_iter().map(ChannelResponse::from).collect(),
    };
    Ok(axum::Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/channels/{id}/activate",
    params(("id" = Uuid, Path, description = "Channel ID")),
    responses(
        (status = 200, description = "Channel activated", body = ChannelResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn activate_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state.channels().activate(id).await?;
    Ok(axum::Json(ChannelResponse::from(channel)))
}

#[utoipa::path(
    post,
    path = "/v1/channels/{id}/deactivate",
    params(("id" = Uuid, Path, description = "Channel ID")),
    responses(
        (status = 200, description = "Channel deactivated", body = ChannelResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn deactivate_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state.channels().deactivate(id).await?;
    Ok(axum::Json(ChannelResponse::from(channel)))
}

#[utoipa::path(
    put,
    path = "/v1/channels/{id}/schedule",
    params(("id" = Uuid, Path, description = "Channel ID")),
    request_body = UpdateScheduleRequest,
    responses(
        (status = 200, description = "Schedule and rate budget replaced", body = ChannelResponse),
        (status = 400, description = "Bad request", body = crate::dto::ErrorResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    axum::Json(body): axum::Json<UpdateScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let channel = state
        .channels()
        .update_schedule(id, body.schedule, RateBudget::from(body.rate_budget))
        .await?;
    Ok(axum::Json(ChannelResponse::from(channel)))
}

#[utoipa::path(
    get,
    path = "/v1/channels/{id}/eligibility",
    params(("id" = Uuid, Path, description = "Channel ID")),
    responses(
        (status = 200, description = "Whether the channel may publish right now", body = EligibilityResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "channels"
)]
pub async fn channel_eligibility(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let eligibility = state.channels().eligibility(id, Utc::now()).await?;
    Ok(axum::Json(EligibilityResponse::new(id, eligibility)))
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/orchestrator",
    responses(
        (status = 200, description = "Current orchestrator state", body = OrchestratorStateResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "orchestrator"
)]
pub async fn orchestrator_state(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let current = state.operator().state().await?;
    Ok(axum::Json(OrchestratorStateResponse {
        state: current.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/orchestrator/pause",
    responses(
        (status = 200, description = "Workers stop leasing new jobs", body = OrchestratorStateResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "orchestrator"
)]
pub async fn pause(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let operator = state.operator();
    operator.pause().await?;
    let current = operator.state().await?;
    Ok(axum::Json(OrchestratorStateResponse {
        state: current.to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/orchestrator/resume",
    responses(
        (status = 200, description = "Workers lease jobs again", body = OrchestratorStateResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "orchestrator"
)]
pub async fn resume(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let operator = state.operator();
    operator.resume().await?;
    let current = operator.state().await?;
    Ok(axum::Json(OrchestratorStateResponse {
        state: current.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_status = match state.db.health_check().await {
        Ok(()) => "ok",
        Err(_) => "error",
    };

    let status = if db_status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let response = HealthResponse {
        status: if db_status == "ok" {
            "healthy"
        } else {
            "unhealthy"
        },
        database: db_status,
    };

    (status, axum::Json(response))
}
