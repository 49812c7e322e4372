use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use strum::Display;
use tracing_subscriber::filter::LevelFilter;

use super::diagnostics::Diagnostic;
use super::diagnostics::Error;
use super::diagnostics::LoadError;
use super::diagnostics::ValidationError;
use super::diagnostics::format_diagnostics;
use super::partial::PartialConfig;
use super::partial::PartialGoveeConfig;
use super::partial::PartialHueConfig;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub poll: PollConfig,
    pub integrations: IntegrationsConfig,
}

// Deserialize is needed for toml::Spanned in the partial config
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"homeio::integrations" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file; required by the sqlite backend
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Seconds between cycles in daemon mode
    pub interval_secs: u64,
    pub adapter_timeout_secs: u64,
    pub concurrent: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            adapter_timeout_secs: 10,
            concurrent: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrationsConfig {
    pub govee: Option<GoveeConfig>,
    pub hue: Option<HueConfig>,
}

/// Govee cloud API credentials
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoveeConfig {
    /// Literal key; prefer `api_key_env` outside of tests
    pub api_key: Option<String>,
    /// Name of the environment variable holding the key
    pub api_key_env: Option<String>,
    /// Override of the API endpoint
    pub base_url: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HueApi {
    /// CLIP v2, percent brightness
    #[default]
    V2,
    /// Legacy REST API, 1-254 brightness
    V1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HueConfig {
    /// Bridge address, either a host or a full base URL
    pub bridge: String,
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    pub api: HueApi,
}

/// Failure to produce a usable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Merge conflicts or validation errors, already rendered for display
    #[error("{0}")]
    Invalid(String),
}

impl Config {
    /// Load configuration from one or more TOML files with import resolution
    ///
    /// Returns the config along with any warnings. Errors from every file are
    /// collected and reported together.
    pub fn from_files(paths: &[PathBuf]) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig into a Config, validating every field
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), ConfigError> {
        let mut invalid = |field: &str, message: String| {
            let (span, source) = partial.origin(field);
            diagnostics.push(Diagnostic::Error(Error::Validation(ValidationError {
                field_path: field.to_string(),
                message,
                span,
                source,
            })));
        };

        let logging = partial
            .logging
            .clone()
            .map(|l| LoggingConfig {
                level: l.level.map(|s| *s.get_ref()).unwrap_or_default(),
                overrides: l
                    .overrides
                    .map(|hm| hm.into_iter().map(|(k, v)| (k, *v.get_ref())).collect())
                    .unwrap_or_default(),
            })
            .unwrap_or_default();

        let store = partial
            .store
            .clone()
            .map(|s| StoreConfig {
                backend: s.backend.map(|b| *b.get_ref()).unwrap_or_default(),
                path: s.path.map(|p| p.into_inner()),
            })
            .unwrap_or_default();
        if store.backend == StoreBackend::Sqlite && store.path.is_none() {
            invalid(
                "store.backend",
                "the sqlite backend needs store.path".to_string(),
            );
        }

        let defaults = PollConfig::default();
        let poll = partial
            .poll
            .clone()
            .map(|p| PollConfig {
                interval_secs: p
                    .interval_secs
                    .map(|v| *v.get_ref())
                    .unwrap_or(defaults.interval_secs),
                adapter_timeout_secs: p
                    .adapter_timeout_secs
                    .map(|v| *v.get_ref())
                    .unwrap_or(defaults.adapter_timeout_secs),
                concurrent: p.concurrent.map(|v| *v.get_ref()).unwrap_or(false),
            })
            .unwrap_or(defaults);
        if poll.interval_secs == 0 {
            invalid("poll.interval_secs", "must be greater than zero".to_string());
        }
        if poll.adapter_timeout_secs == 0 {
            invalid(
                "poll.adapter_timeout_secs",
                "must be greater than zero".to_string(),
            );
        }

        let integrations = partial.integrations.clone().unwrap_or_default();
        let govee = integrations.govee.map(GoveeConfig::from);
        let hue = integrations
            .hue
            .and_then(|h| match HueConfig::try_from(h) {
                Ok(hue) => Some(hue),
                Err((field, message)) => {
                    invalid(field, message);
                    None
                }
            });

        let config = Config {
            logging,
            store,
            poll,
            integrations: IntegrationsConfig { govee, hue },
        };

        if diagnostics.iter().any(|d| d.is_error()) {
            Err(ConfigError::Invalid(format_diagnostics(&diagnostics)))
        } else {
            Ok((config, diagnostics))
        }
    }
}

fn non_empty(value: Option<toml::Spanned<String>>) -> Option<String> {
    value
        .map(|v| v.into_inner().trim().to_string())
        .filter(|v| !v.is_empty())
}

impl From<PartialGoveeConfig> for GoveeConfig {
    fn from(p: PartialGoveeConfig) -> Self {
        Self {
            api_key: non_empty(p.api_key),
            api_key_env: non_empty(p.api_key_env),
            base_url: non_empty(p.base_url),
        }
    }
}

impl TryFrom<PartialHueConfig> for HueConfig {
    /// Offending field and what is wrong with it
    type Error = (&'static str, String);

    fn try_from(p: PartialHueConfig) -> Result<Self, Self::Error> {
        let bridge = non_empty(p.bridge).ok_or((
            "integrations.hue.bridge",
            "the hue bridge address is required".to_string(),
        ))?;
        Ok(Self {
            bridge,
            api_key: non_empty(p.api_key),
            api_key_env: non_empty(p.api_key_env),
            api: p.api.map(|a| *a.get_ref()).unwrap_or_default(),
        })
    }
}
