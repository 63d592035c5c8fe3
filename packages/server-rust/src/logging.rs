//! Tracing subscriber setup.
//!
//! Logs always go to stderr; stdout belongs to the host application
//! protocol of the `jobrelay` binary.
//!
//! # Environment Variables
//!
//! - `JOBRELAY_LOG` - Log filter (overrides `RUST_LOG`)
//! - `JOBRELAY_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard filter (fallback)

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when nothing else is configured.
pub const DEFAULT_FILTER: &str = "info";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable output.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline-delimited JSON.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format '{s}', expected pretty, compact or json"
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        })
    }
}

/// Logging configuration passed to [`init`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives. `None` falls back to [`DEFAULT_FILTER`].
    pub filter: Option<String>,
}

impl LogConfig {
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Fills unset fields from the environment. Values already set (from
    /// command-line flags) win.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = lookup("JOBRELAY_LOG").or_else(|| lookup("RUST_LOG"));
        }
        if let Some(format) = lookup("JOBRELAY_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.format = format;
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let directives = self.filter.as_deref().unwrap_or(DEFAULT_FILTER);
        EnvFilter::try_new(directives).unwrap_or_else(|err| {
            eprintln!("invalid log filter '{directives}' ({err}), using '{DEFAULT_FILTER}'");
            EnvFilter::new(DEFAULT_FILTER)
        })
    }
}

/// Installs the global subscriber. Later calls are ignored.
pub fn init(config: &LogConfig) {
    let filter = config.build_filter();
    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(fmt_layer::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt_layer::layer().compact().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt_layer::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    let _ = result;
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parse_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn jobrelay_log_wins_over_rust_log() {
        let config = LogConfig::default()
            .with_overrides_from(env(&[("JOBRELAY_LOG", "debug"), ("RUST_LOG", "warn")]));
        assert_eq!(config.filter.as_deref(), Some("debug"));

        let config = LogConfig::default().with_overrides_from(env(&[("RUST_LOG", "warn")]));
        assert_eq!(config.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn explicit_filter_is_kept() {
        let config = LogConfig::default()
            .with_filter("jobrelay_server=trace")
            .with_overrides_from(env(&[("JOBRELAY_LOG", "error")]));
        assert_eq!(config.filter.as_deref(), Some("jobrelay_server=trace"));
    }

    #[test]
    fn format_from_environment() {
        let config =
            LogConfig::default().with_overrides_from(env(&[("JOBRELAY_LOG_FORMAT", "json")]));
        assert_eq!(config.format, LogFormat::Json);

        let config =
            LogConfig::default().with_overrides_from(env(&[("JOBRELAY_LOG_FORMAT", "yaml")]));
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let config = LogConfig::default().with_filter("jobrelay=loudest");
        assert_eq!(config.build_filter().to_string(), DEFAULT_FILTER);
    }
}
