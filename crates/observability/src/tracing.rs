//! Tracing/logging initialization.
//!
//! Filtering comes from `RUST_LOG` (default `info`). The output format comes
//! from `TALLY_LOG_FORMAT`:
//!
//! | value              | output                       |
//! |--------------------|------------------------------|
//! | unset, `json`      | one JSON object per line     |
//! | `pretty`, `text`   | human-readable, multi-line   |
//! | anything else      | JSON, with a warning emitted |

use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Environment variable that selects the log format.
pub const LOG_FORMAT_ENV: &str = "TALLY_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Case-insensitive; `None` for unknown names.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Initialize tracing with the format named by [`LOG_FORMAT_ENV`].
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let raw = std::env::var(LOG_FORMAT_ENV).ok();
    let format = raw
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(LogFormat::parse);

    match format {
        None => init_with(LogFormat::default()),
        Some(Some(format)) => init_with(format),
        Some(None) => {
            init_with(LogFormat::default());
            warn!(
                value = raw.as_deref().unwrap_or_default(),
                "unknown {LOG_FORMAT_ENV}; falling back to json"
            );
        }
    }
}

/// Initialize tracing with an explicit format.
pub fn init_with(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_formats_case_insensitively() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse(" JSON "), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("Pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse("text"), Some(LogFormat::Pretty));
    }

    #[test]
    fn unknown_format_is_none() {
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn default_is_json() {
        assert_eq!(LogFormat::default(), LogFormat::Json);
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        init_with(LogFormat::Pretty);
        init_with(LogFormat::Json);
    }
}
