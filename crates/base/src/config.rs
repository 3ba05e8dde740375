//! Logging configuration for the provisioning engine.
//!
//! The engine runs embedded in a host application, so logging is expressed
//! as a list of sink targets rather than a fixed set of switches: the host
//! (or the `GP_LOG_LEVEL` / `GP_LOG_FILE` environment) decides where kernel
//! lifecycle events end up. Each target becomes one `tracing` layer.

use std::{fs::OpenOptions, path::PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use tracing_subscriber::{
    Layer, layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt,
};

use crate::consts::gp_env;

/// One destination for engine logs.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogTarget {
    Stdout,
    Stderr,
    Journald,
    File { path: PathBuf },
}

impl LogTarget {
    /// Builds the `tracing` layer for this target. Targets that cannot be
    /// initialized (unwritable file, no journald socket) are skipped rather
    /// than failing engine startup.
    fn layer<S>(&self) -> Option<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: tracing::Subscriber,
        for<'a> S: LookupSpan<'a>,
    {
        match self {
            Self::Stdout => Some(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stdout)
                    .boxed(),
            ),
            Self::Stderr => Some(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(std::io::stderr)
                    .boxed(),
            ),
            Self::Journald => tracing_journald::layer().ok().map(Layer::boxed),
            Self::File { path } => {
                let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
                // Kernel log files get the verbose format: they are what
                // operators read when a remote launch goes sideways.
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_writer(file)
                        .boxed(),
                )
            }
        }
    }
}

/// Where and at which level the engine logs.
#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LogConfig {
    /// The minimum level recorded.
    #[serde(default = "LogConfig::default_level")]
    #[serde_as(as = "DisplayFromStr")]
    pub level: tracing::Level,

    /// Sinks that receive log events, in order.
    #[serde(default = "LogConfig::default_targets")]
    pub targets: Vec<LogTarget>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: Self::default_level(), targets: Self::default_targets() }
    }
}

impl LogConfig {
    #[inline]
    #[must_use]
    pub const fn default_level() -> tracing::Level { tracing::Level::INFO }

    #[must_use]
    pub fn default_targets() -> Vec<LogTarget> { vec![LogTarget::Stdout] }

    /// Applies the `GP_LOG_LEVEL` and `GP_LOG_FILE` environment overrides,
    /// the same way the rest of the engine reads its operator knobs.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(gp_env::LOG_LEVEL)
            && let Ok(level) = raw.parse()
        {
            self.level = level;
        }
        if let Ok(raw) = std::env::var(gp_env::LOG_FILE)
            && !raw.is_empty()
        {
            let path = PathBuf::from(raw);
            if !self.targets.iter().any(|target| matches!(target, LogTarget::File { .. })) {
                self.targets.push(LogTarget::File { path });
            }
        }
        self
    }

    /// Installs the global `tracing` subscriber for this configuration.
    ///
    /// # Panics
    ///
    /// Panics if a global subscriber has already been installed.
    pub fn init(&self) {
        let layers: Vec<_> = self.targets.iter().filter_map(LogTarget::layer).collect();

        tracing_subscriber::registry()
            .with(tracing_subscriber::filter::LevelFilter::from_level(self.level))
            .with(layers)
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_log_info_to_stdout() {
        let config = LogConfig::default();
        assert_eq!(config.level, tracing::Level::INFO);
        assert_eq!(config.targets, vec![LogTarget::Stdout]);
    }

    #[test]
    fn targets_round_trip_through_serde() {
        let config = LogConfig {
            level: tracing::Level::DEBUG,
            targets: vec![
                LogTarget::Stderr,
                LogTarget::Journald,
                LogTarget::File { path: PathBuf::from("/var/log/tether.log") },
            ],
        };
        let raw = serde_json::to_string(&config).unwrap();
        let parsed: LogConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.level, tracing::Level::DEBUG);
        assert_eq!(parsed.targets, config.targets);
    }

    #[test]
    fn level_parses_from_display_form() {
        let parsed: LogConfig =
            serde_json::from_str(r#"{ "level": "warn", "targets": [{"type": "stdout"}] }"#)
                .unwrap();
        assert_eq!(parsed.level, tracing::Level::WARN);
    }
}
