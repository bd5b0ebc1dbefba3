use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Longest prefix of user text that may appear in debug logs.
pub const SANITIZED_TEXT_LEN: usize = 50;

const DEFAULT_FILTER: &str = "info,assistant_orchestrator=debug";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

/// Install the global tracing subscriber.
///
/// Level filtering comes from `RUST_LOG`; output is compact text or JSON
/// lines depending on `config.format`. Call once, from the binary.
pub fn init(config: &LoggingConfig) {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter_layer);

    match config.format {
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .init(),
    }
}

/// Shorten user text for logs, keeping at most [`SANITIZED_TEXT_LEN`] chars.
pub fn sanitize_text(text: &str) -> String {
    if text.chars().count() <= SANITIZED_TEXT_LEN {
        return text.to_string();
    }
    let mut short: String = text.chars().take(SANITIZED_TEXT_LEN).collect();
    short.push_str("...");
    short
}
