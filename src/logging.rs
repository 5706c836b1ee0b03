//! Logging setup for the forkpool binary and embedding programs.
//!
//! The library only emits `tracing` events; nothing is printed unless the
//! embedding program installs a subscriber, e.g. with [`init`].
//!
//! # Environment Variables
//!
//! - `FORKPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `FORKPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `FORKPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `FORKPOOL_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Worker processes inherit the subscriber through `fork`. File output uses a
//! blocking appender, since a background writer thread would not exist in
//! the forked children.
//!
//! # Example
//!
//! ```no_run
//! use forkpool::logging::{LogConfig, init};
//!
//! init(LogConfig::default().with_env_overrides());
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-field format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON lines for log aggregation
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    /// Output format (default: Pretty)
    pub format: LogFormat,
    /// Additional log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show target module in logs (default: true)
    pub show_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
            show_target: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `-v` counts to a level: 0 = warn, 1 = info, 2 = debug, 3+ = trace.
    pub fn from_verbosity(verbose: u8) -> Self {
        let level = match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        Self::default().with_level(level)
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set by the caller wins over `FORKPOOL_LOG` and
    /// `RUST_LOG`; `FORKPOOL_LOG_LEVEL` only applies when no filter is set.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("FORKPOOL_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level) = std::env::var("FORKPOOL_LOG_LEVEL")
        {
            self.level = parse_level(&level).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("FORKPOOL_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Ok(path) = std::env::var("FORKPOOL_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let default = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                default()
            }),
            None => default(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(format: LogFormat, show_target: bool, ansi: bool, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_target(show_target)
        .with_ansi(ansi)
        .with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.boxed(),
    }
}

/// Install the global subscriber.
///
/// Logs go to stderr and, if `file_path` is set, to that file as well.
/// Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![fmt_layer(
        config.format,
        config.show_target,
        true,
        std::io::stderr,
    )];

    if let Some(path) = &config.file_path {
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("forkpool.log");
        let appender = RollingFileAppender::new(Rotation::NEVER, dir, file_name);
        layers.push(fmt_layer(config.format, config.show_target, false, appender));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Compact.to_string(), "compact");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("error"), Some(Level::ERROR));
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_from_verbosity() {
        assert_eq!(LogConfig::from_verbosity(0).level, Level::WARN);
        assert_eq!(LogConfig::from_verbosity(1).level, Level::INFO);
        assert_eq!(LogConfig::from_verbosity(2).level, Level::DEBUG);
        assert_eq!(LogConfig::from_verbosity(9).level, Level::TRACE);
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::new()
            .with_format(LogFormat::Json)
            .with_filter("forkpool=trace".to_string())
            .with_file(PathBuf::from("/tmp/forkpool.log"));

        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.filter.as_deref(), Some("forkpool=trace"));
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/forkpool.log")));
        // Explicit filters are not replaced by the environment.
        assert_eq!(
            config.with_env_overrides().filter.as_deref(),
            Some("forkpool=trace")
        );
    }

    #[test]
    fn test_invalid_filter_falls_back_to_level() {
        let config = LogConfig::new()
            .with_level(Level::INFO)
            .with_filter("[[[".to_string());
        assert_eq!(config.build_filter().to_string(), "info");
    }
}
