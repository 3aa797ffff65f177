//! Structured logging. One trace id per process, attached to every error.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

static PROCESS_TRACE_ID: OnceLock<String> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// `APP_LOG_LEVEL` wins over `RUST_LOG`; the default level is `info`.
fn filter_directive(lookup: impl Fn(&str) -> Option<String>) -> String {
    lookup("APP_LOG_LEVEL")
        .or_else(|| lookup("RUST_LOG"))
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub fn init_tracing() {
    let lookup = |name: &str| std::env::var(name).ok();
    let filter = EnvFilter::new(filter_directive(lookup));
    let format = LogFormat::parse(lookup("SOCIALCHAT_LOG_FORMAT").as_deref());

    let installed = match format {
        LogFormat::Json => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_env_filter(filter)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .finish(),
        ),
        LogFormat::Pretty => tracing::subscriber::set_global_default(
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .finish(),
        ),
    };
    if installed.is_err() {
        return;
    }

    tracing::info!(
        component = "bootstrap",
        trace_id = %trace_id(),
        client_info = crate::protocol::CLIENT_INFO,
        ?format,
        "logging ready"
    );
}

pub fn trace_id() -> &'static str {
    PROCESS_TRACE_ID.get_or_init(|| Uuid::new_v4().to_string())
}

pub fn request_id() -> String {
    Uuid::new_v4().to_string()
}
