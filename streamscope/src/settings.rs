use std::path::{Path, PathBuf};

use clap::Parser;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, File};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use thiserror::Error;

mod exporter_settings;
mod management_settings;
mod tracker_settings;

pub use exporter_settings::ExporterSettings;
pub use management_settings::{Credentials, ManagementSettings};
pub use tracker_settings::TrackerSettings;

const APP_ENVIRONMENT: &str = "APP_ENVIRONMENT";
const APP_ENV_PREFIX: &str = "APP";
const APP_ENV_SEPARATOR: &str = "__";
const APPLICATION_CONFIG: &str = "application.ron";
const DEFAULT_RESOURCES_DIR: &str = "./resources";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),

    #[error("unrecognized {APP_ENVIRONMENT} value: {0}")]
    Environment(String),

    #[error("invalid request header in settings: {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),

    #[error("invalid request header value in settings: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum AppEnvironment {
    Local,
    Production,
}

impl Default for AppEnvironment {
    fn default() -> Self {
        Self::Local
    }
}

impl AppEnvironment {
    /// Reads the environment from `APP_ENVIRONMENT`, defaulting to local when unset.
    pub fn from_env() -> Result<Self, SettingsError> {
        match std::env::var(APP_ENVIRONMENT) {
            Ok(rep) => rep.parse().map_err(|_| SettingsError::Environment(rep)),
            Err(_) => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Settings {
    #[serde(default)]
    pub http: HttpServerSettings,
    #[serde(default)]
    pub management: ManagementSettings,
    #[serde(default)]
    pub tracker: TrackerSettings,
    #[serde(default)]
    pub exporter: ExporterSettings,
}

#[derive(Parser, Clone, Debug, Default, PartialEq, Eq)]
#[clap(author, version, about)]
pub struct CliOptions {
    /// override environment-based configuration file to load.
    /// Default behavior is to load configuration based on `APP_ENVIRONMENT` envvar.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// specify path to secrets configuration file
    #[clap(short, long)]
    pub secrets: Option<PathBuf>,

    #[clap(short, long)]
    pub environment: Option<AppEnvironment>,

    /// Override default location from which to load configuration files. Default directory is
    /// ./resources.
    #[clap(short, long)]
    pub resources: Option<PathBuf>,

    /// Override the refresh interval in seconds. Zero disables automatic refresh, leaving the
    /// `POST /refresh` endpoint as the only trigger.
    #[clap(long)]
    pub refresh_secs: Option<u64>,

    /// Track only the named instance. May be repeated; overrides the configured allow-list.
    #[clap(short, long = "instance")]
    pub instances: Vec<String>,
}

impl CliOptions {
    fn load_overrides(&self, config: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, SettingsError> {
        let config = match self.refresh_secs {
            None => config,
            Some(secs) => config.set_override("tracker.refresh_interval_secs", secs)?,
        };

        let config = if self.instances.is_empty() {
            config
        } else {
            config.set_override("tracker.instances", self.instances.clone())?
        };

        Ok(config)
    }
}

impl Settings {
    /// Layers configuration sources, later sources overriding earlier ones: the application
    /// resource file, the environment's resource file, the explicit config and secrets files,
    /// `APP__` environment variables and finally command line overrides.
    #[tracing::instrument(level = "info")]
    pub fn load(options: &CliOptions) -> Result<Self, SettingsError> {
        let resources = options
            .resources
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RESOURCES_DIR));
        let environment = match options.environment {
            Some(env) => env,
            None => AppEnvironment::from_env()?,
        };
        tracing::info!(?resources, %environment, "loading settings");

        let mut builder = Config::builder()
            .add_source(Self::file_source(&resources.join(APPLICATION_CONFIG), false))
            .add_source(Self::file_source(&resources.join(format!("{environment}.ron")), false));

        if let Some(ref path) = options.config {
            builder = builder.add_source(Self::file_source(path, true));
        }

        if let Some(ref path) = options.secrets {
            builder = builder.add_source(Self::file_source(path, true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(APP_ENV_PREFIX)
                .separator(APP_ENV_SEPARATOR)
                .try_parsing(true),
        );

        let builder = options.load_overrides(builder)?;
        let settings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    fn file_source(path: &Path, required: bool) -> File<config::FileSourceFile, config::FileFormat> {
        File::from(path).format(config::FileFormat::Ron).required(required)
    }
}
