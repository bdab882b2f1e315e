//! Telemetry utilities: global subscriber setup and task-scoped correlation ids.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
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

/// Correlation metadata for the request or sync task currently being processed.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Builds a context from an inbound header value, generating one when absent.
    pub fn from_header(value: Option<&str>) -> Self {
        let trace_id = value
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Self { trace_id }
    }

    /// Context for a background sync task; the task id doubles as correlation id.
    pub fn for_task(task_id: Uuid) -> Self {
        Self {
            trace_id: format!("task-{task_id}"),
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

/// Installs the global subscriber once per process. `log::` records from
/// sqlx and sea-orm are bridged into tracing first.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    install_log_bridge();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(output_layer(&config.log_format))
        .try_init();

    if let Err(err) = installed {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("warning: tracing subscriber not installed ({err}); keeping the existing one");
    }
    Ok(())
}

/// `pretty` for local runs; anything else emits JSON lines with the current span.
fn output_layer<S>(format: &str) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    match format {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().with_current_span(true).boxed(),
    }
}

fn install_log_bridge() {
    let Err(err) = LogTracer::builder().with_max_level(LevelFilter::Trace).init() else {
        return;
    };
    // A bridge registered earlier (tests, embedding binaries) is fine.
    if !type_name_of_val(log::logger()).contains("LogTracer") {
        eprintln!("warning: log bridge not installed ({err}); sqlx records will bypass tracing");
    }
}

/// Run `future` with `context` installed in task-local storage.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// The active correlation id, if one has been set for the running task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trace_id_visible_inside_scope_only() {
        assert!(current_trace_id().is_none());
        let seen = with_trace_context(TraceContext::from_header(Some("abc-123")), async {
            current_trace_id()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("abc-123"));
        assert!(current_trace_id().is_none());
    }

    #[test]
    fn blank_header_generates_id() {
        let ctx = TraceContext::from_header(Some("   "));
        assert_eq!(ctx.trace_id.len(), 32);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        let config = AppConfig::default();
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_ok());
    }
}
