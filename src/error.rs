//! # Error Handling
//!
//! [`AdsError`] is the error taxonomy shared by the credential, executor,
//! adapter and sync layers. [`ApiError`] is the problem+json shape returned to
//! callers of the HTTP surface, with trace ID propagation.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::telemetry;

/// Errors produced by the credential lifecycle and synchronization core.
#[derive(Debug, Error)]
pub enum AdsError {
    /// The refresh token itself was rejected; the user has to reconnect.
    #[error("refresh token rejected, reconnect required: {0}")]
    AuthExpired(String),
    /// The access token was rejected by a listing call.
    #[error("access token rejected by upstream")]
    AccessTokenRejected,
    #[error("rate limit retry budget exhausted after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },
    /// The category is not entitled for this user. A normal result, not a failure.
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("upstream unavailable after {attempts} attempts: {reason}")]
    UpstreamUnavailable { attempts: u32, reason: String },
    #[error("listing stopped after {pages_fetched} pages: {reason}")]
    PartialPageFailure { pages_fetched: u32, reason: String },
    #[error("invalid relationship: {0}")]
    GraphValidation(String),
    /// A 4xx response other than 401/403/429. Never retried.
    #[error("upstream rejected request with status {status}: {message}")]
    UpstreamRejected { status: u16, message: String },
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("credential {0} is disabled, reconnect required")]
    CredentialDisabled(Uuid),
    #[error("deadline exceeded after {seconds}s")]
    DeadlineExceeded { seconds: u64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("sync {sync_id} is already running for user {user_id}")]
    SyncInProgress { user_id: Uuid, sync_id: Uuid },
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("corrupt stored value: {0}")]
    CorruptRecord(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdsError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        AdsError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable SCREAMING_SNAKE code used in API errors and sync history details.
    pub fn code(&self) -> &'static str {
        match self {
            AdsError::AuthExpired(_) => "AUTH_EXPIRED",
            AdsError::AccessTokenRejected => "ACCESS_TOKEN_REJECTED",
            AdsError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            AdsError::AccessDenied(_) => "ACCESS_DENIED",
            AdsError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            AdsError::PartialPageFailure { .. } => "PARTIAL_PAGE_FAILURE",
            AdsError::GraphValidation(_) => "GRAPH_VALIDATION_FAILED",
            AdsError::UpstreamRejected { .. } => "UPSTREAM_REJECTED",
            AdsError::MalformedResponse(_) => "MALFORMED_RESPONSE",
            AdsError::NotFound { .. } => "NOT_FOUND",
            AdsError::CredentialDisabled(_) => "RECONNECT_REQUIRED",
            AdsError::DeadlineExceeded { .. } => "DEADLINE_EXCEEDED",
            AdsError::Cancelled => "CANCELLED",
            AdsError::SyncInProgress { .. } => "SYNC_IN_PROGRESS",
            AdsError::Storage(_) => "STORAGE_ERROR",
            AdsError::Crypto(_) => "CRYPTO_ERROR",
            AdsError::CorruptRecord(_) => "CORRUPT_RECORD",
            AdsError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// True when the user must re-run the authorization handshake.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            AdsError::AuthExpired(_) | AdsError::CredentialDisabled(_)
        )
    }
}

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable error message
    pub message: Box<str>,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            trace_id: Self::current_trace_id(),
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    /// Trace ID of the current request, falling back to a generated correlation ID
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| Some(format!("corr-{}", &Uuid::new_v4().to_string()[..8]).into_boxed_str()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<AdsError> for ApiError {
    fn from(error: AdsError) -> Self {
        let error = match error {
            AdsError::Storage(db_err) => return ApiError::from(db_err),
            other => other,
        };

        let status = match &error {
            AdsError::NotFound { .. } => StatusCode::NOT_FOUND,
            AdsError::GraphValidation(_) => StatusCode::BAD_REQUEST,
            AdsError::AuthExpired(_) | AdsError::CredentialDisabled(_) => StatusCode::CONFLICT,
            AdsError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AdsError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AdsError::UpstreamUnavailable { .. }
            | AdsError::AccessTokenRejected
            | AdsError::UpstreamRejected { .. }
            | AdsError::MalformedResponse(_)
            | AdsError::PartialPageFailure { .. } => StatusCode::BAD_GATEWAY,
            AdsError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            AdsError::Cancelled | AdsError::SyncInProgress { .. } => StatusCode::CONFLICT,
            AdsError::Storage(_)
            | AdsError::Crypto(_)
            | AdsError::CorruptRecord(_)
            | AdsError::Internal(_) => {
                tracing::error!(error = %error, "Internal sync core error");
                return Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "An internal error occurred",
                );
            }
        };

        Self::new(status, error.code(), &error.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("Database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            _ => {
                tracing::error!("Database error: {:?}", error);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_SERVER_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// Create an unauthorized error (401)
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// Create a validation error with field details
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}
