//! # Sync API Handlers
//!
//! Trigger, inspect and cancel per-user sync passes.

use axum::{
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::models::AccountCategory;
use crate::server::AppState;
use crate::sync_orchestrator::SyncReport;

/// Request body for triggering a sync
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct TriggerSyncRequest {
    /// Categories to sync; every category when omitted
    #[schema(example = json!(["advertising", "dsp"]))]
    pub categories: Option<Vec<AccountCategory>>,
}

/// Response returned when a sync has been accepted
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TriggerSyncResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub sync_id: Uuid,
}

/// Response returned when cancellation has been requested
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelSyncResponse {
    pub sync_id: Uuid,
    #[schema(example = "cancelling")]
    pub status: String,
}

/// Start a sync pass for a user
#[utoipa::path(
    post,
    path = "/users/{user_id}/syncs",
    security(("bearer_auth" = [])),
    params(
        ("user_id" = Uuid, Path, description = "User whose accounts are synced")
    ),
    request_body(content = TriggerSyncRequest, description = "Optional category filter"),
    responses(
        (status = 202, description = "Sync accepted", body = TriggerSyncResponse),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "User has no active credential", body = ApiError),
        (status = 409, description = "A sync is already running for the user", body = ApiError)
    ),
    tag = "syncs"
)]
pub async fn trigger_sync(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(user_id): Path<Uuid>,
    body: Result<Option<Json<TriggerSyncRequest>>, JsonRejection>,
) -> Result<(StatusCode, Json<TriggerSyncResponse>), ApiError> {
    let request = body?.map(|Json(request)| request).unwrap_or_default();

    if let Some(categories) = &request.categories
        && categories.is_empty()
    {
        return Err(validation_error(
            "Invalid categories",
            serde_json::json!({ "categories": "Must name at least one category when present" }),
        ));
    }

    let sync_id = state
        .orchestrator
        .trigger_sync(user_id, request.categories)
        .await?;

    tracing::info!(user_id = %user_id, sync_id = %sync_id, "Sync triggered");
    Ok((StatusCode::ACCEPTED, Json(TriggerSyncResponse { sync_id })))
}

/// Current state of a sync pass
#[utoipa::path(
    get,
    path = "/syncs/{sync_id}",
    security(("bearer_auth" = [])),
    params(
        ("sync_id" = Uuid, Path, description = "Sync identifier returned when triggering")
    ),
    responses(
        (status = 200, description = "Sync state", body = SyncReport),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Unknown sync", body = ApiError)
    ),
    tag = "syncs"
)]
pub async fn get_sync(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(sync_id): Path<Uuid>,
) -> Result<Json<SyncReport>, ApiError> {
    let report = state.orchestrator.get_sync_status(sync_id).await?;
    Ok(Json(report))
}

/// Request cooperative cancellation of a running sync
#[utoipa::path(
    delete,
    path = "/syncs/{sync_id}",
    security(("bearer_auth" = [])),
    params(
        ("sync_id" = Uuid, Path, description = "Sync identifier")
    ),
    responses(
        (status = 202, description = "Cancellation requested", body = CancelSyncResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Unknown sync", body = ApiError),
        (status = 409, description = "Sync already completed", body = ApiError)
    ),
    tag = "syncs"
)]
pub async fn cancel_sync(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(sync_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelSyncResponse>), ApiError> {
    if !state.orchestrator.cancel(sync_id).await? {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            "SYNC_COMPLETED",
            "Sync has already completed",
        ));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelSyncResponse {
            sync_id,
            status: "cancelling".to_string(),
        }),
    ))
}
