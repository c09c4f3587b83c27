use crate::config::AppConfig;
use std::env;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub fn trace_log_path() -> PathBuf {
    env::var("ECHOMON_TRACE_LOG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("echomon_trace.jsonl"))
}

/// Install the global subscriber once: human-readable stderr by default,
/// JSON-lines to a file when `--log-json` is set.
pub fn init_tracing(config: &AppConfig) {
    let json = config.log_json;
    let _ = TRACING_INIT.get_or_init(|| {
        if json {
            let path = trace_log_path();
            let file = match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => file,
                Err(_) => return,
            };
            let subscriber = tracing_subscriber::fmt()
                .json()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(file)
                .with_current_span(false)
                .with_span_list(false)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        } else {
            let subscriber = tracing_subscriber::fmt()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(io::stderr)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    });
}
