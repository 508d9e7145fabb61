//! Structured logging setup shared by every crate in the workspace.
//!
//! Each binary calls [`init`] once at startup; everything downstream just takes a
//! `Logger` handle and calls the re-exported `slog` macros on it. A library crate that
//! doesn't care about logging can always fall back to `Logger::root(Discard, o!())`.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

use serde_derive::Deserialize;
use sloggers::Config as SloggersConfig;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogDestination {
    Stderr,
    Stdout,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_destination")]
    pub destination: LogDestination,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_destination() -> LogDestination {
    LogDestination::Stderr
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            destination: default_destination(),
        }
    }
}

/// Builds the root logger for `component` (e.g. `"kiss"`, `"coordinator"`, `"dgpd"`).
///
/// Falls back to a terminal logger at `info` level on stderr when `config` is `None`,
/// which is enough for interactive use and for tests that don't care about log output.
pub fn init(component: &str, config: Option<&LoggingConfig>) -> Logger {
    let owned;
    let config = match config {
        Some(c) => c,
        None => {
            owned = LoggingConfig::default();
            &owned
        }
    };

    let destination = match config.destination {
        LogDestination::Stderr => "stderr",
        LogDestination::Stdout => "stdout",
    };

    let toml = format!(
        "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"{}\"\n",
        config.level, destination
    );

    let sloggers_config: sloggers::LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("invalid logging configuration");

    let logger = sloggers_config
        .build_logger()
        .expect("failed to build logger");

    logger.new(o!("component" => component.to_string()))
}

/// Loads a [`LoggingConfig`] section out of a freestanding TOML file, if present. Returns
/// `None` rather than an error when the file doesn't exist, since logging configuration
/// is always optional.
pub fn load_config(path: &Path) -> Option<LoggingConfig> {
    let contents = fs::read_to_string(path).ok()?;
    serdeconv::from_toml_str(&contents).ok()
}
