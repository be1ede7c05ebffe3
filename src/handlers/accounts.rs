//! # Account API Handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::ApiError;
use crate::models::{RelationshipKind, account};
use crate::repositories::RelatedAccount;
use crate::server::AppState;

/// Summary of an account adjacent in the relationship graph
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RelatedAccountInfo {
    pub account_id: Uuid,
    /// One of advertising, dsp or amc
    #[schema(example = "amc")]
    pub category: String,
    /// Amazon-side identifier
    #[schema(example = "amc-instance-1")]
    pub external_id: String,
    pub display_name: String,
    #[schema(example = "active")]
    pub status: String,
    pub kind: RelationshipKind,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl From<RelatedAccount> for RelatedAccountInfo {
    fn from(related: RelatedAccount) -> Self {
        let account::Model {
            id,
            category,
            external_id,
            display_name,
            status,
            last_synced_at,
            ..
        } = related.account;

        Self {
            account_id: id,
            category,
            external_id,
            display_name,
            status,
            kind: related.kind,
            last_synced_at: last_synced_at.map(|at| at.with_timezone(&Utc)),
        }
    }
}

/// Direct parents and children of an account
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RelationshipsResponse {
    pub account_id: Uuid,
    pub parents: Vec<RelatedAccountInfo>,
    pub children: Vec<RelatedAccountInfo>,
}

/// Relationships of an account
#[utoipa::path(
    get,
    path = "/accounts/{account_id}/relationships",
    security(("bearer_auth" = [])),
    params(
        ("account_id" = Uuid, Path, description = "Account identifier")
    ),
    responses(
        (status = 200, description = "Direct parents and children", body = RelationshipsResponse),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Unknown account", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn get_relationships(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(account_id): Path<Uuid>,
) -> Result<Json<RelationshipsResponse>, ApiError> {
    let related = state.graph.get_related(account_id).await?;

    Ok(Json(RelationshipsResponse {
        account_id,
        parents: related.parents.into_iter().map(Into::into).collect(),
        children: related.children.into_iter().map(Into::into).collect(),
    }))
}

/// Disconnect an account and drop its relationship edges
#[utoipa::path(
    delete,
    path = "/accounts/{account_id}",
    security(("bearer_auth" = [])),
    params(
        ("account_id" = Uuid, Path, description = "Account identifier")
    ),
    responses(
        (status = 204, description = "Account disconnected"),
        (status = 401, description = "Missing or invalid bearer token", body = ApiError),
        (status = 404, description = "Unknown account", body = ApiError)
    ),
    tag = "accounts"
)]
pub async fn disconnect_account(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    Path(account_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.accounts.disconnect(account_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
