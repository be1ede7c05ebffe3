//! # Server Configuration
//!
//! Router, shared state and OpenAPI document for the sync service.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::adapters::SourceRegistry;
use crate::ads_api::AdsApi;
use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::handlers;
use crate::rate_limit::RateLimitedExecutor;
use crate::repositories::{
    AccountRepository, CredentialStore, RelationshipGraph, SyncHistoryRepository,
};
use crate::sync_orchestrator::SyncOrchestrator;
use crate::telemetry::{TraceContext, with_trace_context};
use crate::token_refresh::RefreshScheduler;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub orchestrator: SyncOrchestrator,
    pub accounts: AccountRepository,
    pub graph: RelationshipGraph,
}

/// The core components wired together from configuration. One rate-limited
/// executor is shared by the refresh scheduler and every account source.
#[derive(Clone)]
pub struct Services {
    pub state: AppState,
    pub credentials: CredentialStore,
    pub refresher: RefreshScheduler,
}

impl Services {
    pub fn build(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        crypto_key: CryptoKey,
        api: Arc<dyn AdsApi>,
    ) -> Self {
        let executor = Arc::new(RateLimitedExecutor::new(&config.rate_limit));
        let credentials = CredentialStore::new(
            Arc::clone(&db),
            crypto_key,
            config.credential_refresh.failure_threshold,
        );
        let refresher = RefreshScheduler::new(
            config.credential_refresh.clone(),
            credentials.clone(),
            Arc::clone(&api),
            Arc::clone(&executor),
        );
        let accounts = AccountRepository::new(Arc::clone(&db));
        let graph = RelationshipGraph::new(Arc::clone(&db));
        let orchestrator = SyncOrchestrator::new(
            config.sync.clone(),
            credentials.clone(),
            accounts.clone(),
            graph.clone(),
            SyncHistoryRepository::new(Arc::clone(&db)),
            SourceRegistry::amazon(api, executor, &config.sync),
            refresher.clone(),
        );

        Self {
            state: AppState {
                config,
                db,
                orchestrator,
                accounts,
                graph,
            },
            credentials,
            refresher,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/openapi.json", get(openapi_json));

    let protected_routes = Router::new()
        .route("/users/{user_id}/syncs", post(handlers::syncs::trigger_sync))
        .route(
            "/syncs/{sync_id}",
            get(handlers::syncs::get_sync).delete(handlers::syncs::cancel_sync),
        )
        .route(
            "/accounts/{account_id}/relationships",
            get(handlers::accounts::get_relationships),
        )
        .route(
            "/accounts/{account_id}",
            delete(handlers::accounts::disconnect_account),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Runs each request inside a fresh trace context and echoes its id.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let context = TraceContext::generate();
    let trace_id = context.trace_id.clone();
    request.extensions_mut().insert(context.clone());

    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Serves until `shutdown` is cancelled, then drains in-flight requests.
pub async fn run_server(
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = state
        .config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, profile = %profile, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::syncs::trigger_sync,
        crate::handlers::syncs::get_sync,
        crate::handlers::syncs::cancel_sync,
        crate::handlers::accounts::get_relationships,
        crate::handlers::accounts::disconnect_account,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::AccountCategory,
            crate::models::CategoryOutcome,
            crate::models::SyncStatus,
            crate::models::RelationshipKind,
            crate::handlers::HealthStatus,
            crate::handlers::syncs::TriggerSyncRequest,
            crate::handlers::syncs::TriggerSyncResponse,
            crate::handlers::syncs::CancelSyncResponse,
            crate::handlers::accounts::RelatedAccountInfo,
            crate::handlers::accounts::RelationshipsResponse,
            crate::sync_orchestrator::SyncReport,
            crate::sync_orchestrator::CategoryResult,
            crate::sync_orchestrator::CategoryError,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "root", description = "Service information and health"),
        (name = "syncs", description = "Account synchronization passes"),
        (name = "accounts", description = "Synced accounts and their relationships"),
    ),
    info(
        title = "Amazon Ads Connect API",
        description = "Credential lifecycle and account sync for Amazon Ads",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
