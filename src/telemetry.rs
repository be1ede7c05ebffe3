//! Telemetry: global subscriber setup, task-local trace context and the metric
//! names emitted by the credential and sync core.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;

pub const METRIC_REFRESH_ATTEMPTS: &str = "ads_connect_refresh_attempts_total";
pub const METRIC_REFRESH_SUCCESS: &str = "ads_connect_refresh_success_total";
pub const METRIC_REFRESH_FAILURE: &str = "ads_connect_refresh_failure_total";
pub const METRIC_CREDENTIALS_DISABLED: &str = "ads_connect_credentials_disabled_total";
pub const METRIC_REFRESH_TICK_CANDIDATES: &str = "ads_connect_refresh_tick_candidates";
pub const METRIC_LIMITER_WAIT: &str = "ads_connect_limiter_wait_seconds";
pub const METRIC_UPSTREAM_RETRIES: &str = "ads_connect_upstream_retries_total";
pub const METRIC_ADAPTER_LATENCY: &str = "ads_connect_adapter_latency_seconds";
pub const METRIC_SYNC_CATEGORY_OUTCOMES: &str = "ads_connect_sync_category_outcomes_total";
pub const METRIC_SYNCS_RUNNING: &str = "ads_connect_syncs_running";

/// Trace context containing request correlation ID.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    pub fn generate() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing exactly once, bridging `log` records (sqlx) into tracing.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        // Another LogTracer already installed counts as success.
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: failed to install log tracer bridge: {}. sqlx events will not be traced.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    describe_metrics();
    Ok(())
}

/// Register descriptions for every metric the service emits.
pub fn describe_metrics() {
    describe_counter!(METRIC_REFRESH_ATTEMPTS, "Token refresh attempts");
    describe_counter!(METRIC_REFRESH_SUCCESS, "Successful token refreshes");
    describe_counter!(METRIC_REFRESH_FAILURE, "Failed token refreshes by error code");
    describe_counter!(
        METRIC_CREDENTIALS_DISABLED,
        "Credentials disabled and awaiting reconnect"
    );
    describe_gauge!(
        METRIC_REFRESH_TICK_CANDIDATES,
        "Credentials found expiring on the last scheduler tick"
    );
    describe_histogram!(
        METRIC_LIMITER_WAIT,
        Unit::Seconds,
        "Time spent waiting for rate limiter capacity"
    );
    describe_counter!(METRIC_UPSTREAM_RETRIES, "Upstream retries by failure class");
    describe_histogram!(
        METRIC_ADAPTER_LATENCY,
        Unit::Seconds,
        "Account source listing latency by category"
    );
    describe_counter!(
        METRIC_SYNC_CATEGORY_OUTCOMES,
        "Sync category outcomes by category and outcome"
    );
    describe_gauge!(METRIC_SYNCS_RUNNING, "Sync passes currently running");
}

/// Run `future` with `context` available through [`current_trace_id`].
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Get the currently active trace ID, if one has been set for the running task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_id_is_scoped_to_the_future() {
        assert_eq!(current_trace_id(), None);

        let context = TraceContext {
            trace_id: "abc123".to_string(),
        };
        let seen = with_trace_context(context, async { current_trace_id() }).await;

        assert_eq!(seen.as_deref(), Some("abc123"));
        assert_eq!(current_trace_id(), None);
    }

    #[test]
    fn generated_trace_ids_are_unique() {
        assert_ne!(
            TraceContext::generate().trace_id,
            TraceContext::generate().trace_id
        );
    }
}
