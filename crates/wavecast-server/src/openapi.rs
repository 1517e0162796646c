use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Wavecast API",
        version = "0.1.0",
        description = "Operator API for the Wavecast job queue and multi-channel publication orchestrator."
    ),
    paths(
        crate::routes::submit_item,
        crate::routes::get_item,
        crate::routes::fail_item,
        crate::routes::list_jobs,
        crate::routes::get_job,
        crate::routes::retry_job,
        crate::routes::schedule_wave,
        crate::routes::get_wave,
        crate::routes::add_wave_members,
        crate::routes::create_channel,
        crate::routes::list_channels,
        crate::routes::activate_channel,
        crate::routes::deactivate_channel,
        crate::routes::update_schedule,
        crate::routes::channel_eligibility,
        crate::routes::orchestrator_state,
        crate::routes::pause,
        crate::routes::resume,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SubmitItemRequest,
        crate::dto::SubmitItemResponse,
        crate::dto::FailItemRequest,
        crate::dto::ItemResponse,
        crate::dto::ItemDetailResponse,
        crate::dto::JobResponse,
        crate::dto::JobListResponse,
        crate::dto::WaveMemberDto,
        crate::dto::ScheduleWaveRequest,
        crate::dto::AddWaveMembersRequest,
        crate::dto::WaveMemberResponse,
        crate::dto::WaveStatusResponse,
        crate::dto::WaveResponse,
        crate::dto::RateBudgetDto,
        crate::dto::CreateChannelRequest,
        crate::dto::UpdateScheduleRequest,
        crate::dto::ChannelResponse,
        crate::dto::ChannelListResponse,
        crate::dto::EligibilityResponse,
        crate::dto::OrchestratorStateResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "items", description = "Content item submission and inspection"),
        (name = "jobs", description = "Processing jobs and dead-letter retry"),
        (name = "waves", description = "Coordinated multi-channel releases"),
        (name = "channels", description = "Publication channels, schedules and budgets"),
        (name = "orchestrator", description = "Global pause and resume"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Operator token. Set via WAVECAST_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
