use std::fmt;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,lpio=debug";

// ---------------------------------------------------------------------------
// Log Format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Subscriber setup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter directive, overridden by `RUST_LOG`
    pub filter: Option<String>,
}

impl LogConfig {
    /// Build from `LPIO_LOG_FORMAT`
    pub fn from_env() -> Self {
        Self {
            format: std::env::var("LPIO_LOG_FORMAT")
                .map(|v| LogFormat::from_str(&v))
                .unwrap_or_default(),
            filter: None,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            self.filter
                .as_deref()
                .unwrap_or(DEFAULT_FILTER)
                .into()
        })
    }
}

/// Install the global tracing subscriber.
///
/// Returns false if one was already installed.
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(config.env_filter())
        .with_thread_ids(true);

    let result = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_format_names() {
        assert_eq!(LogFormat::from_str("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::from_str("pretty"), LogFormat::Text);
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn second_init_is_refused() {
        let config = LogConfig::default();
        init(&config);
        assert!(!init(&config));
    }
}
