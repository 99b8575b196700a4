use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use url::Url;

use super::SettingsError;

/// Basic auth credentials shared by the management REST calls and bulk document retrieval.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.username == other.username && self.password.expose_secret() == other.password.expose_secret()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[cfg_attr(test, derive(PartialEq))]
pub struct ManagementSettings {
    #[serde(default = "ManagementSettings::default_scheme")]
    pub scheme: String,

    #[serde(default = "ManagementSettings::default_host")]
    pub host: String,

    #[serde(default = "ManagementSettings::default_port")]
    pub port: u16,

    #[serde(default = "ManagementSettings::default_base_path")]
    pub base_path: String,

    #[serde(default = "ManagementSettings::default_domain")]
    pub domain: String,

    /// Secrets are loaded only; they never serialize back out.
    #[serde(default, skip_serializing)]
    pub credentials: Option<Credentials>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,

    #[serde(default = "ManagementSettings::default_max_retries")]
    pub max_retries: u32,

    #[serde(default, rename = "pool_idle_timeout_secs", skip_serializing_if = "Option::is_none")]
    #[serde_as(as = "Option<DurationSeconds>")]
    pub pool_idle_timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_max_idle_per_host: Option<usize>,

    /// Replaces the host of bulk document uris handed out by the management server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_host: Option<String>,

    /// Replaces the port of bulk document uris handed out by the management server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_port: Option<u16>,

    #[serde(
        default = "ManagementSettings::default_notification_poll_interval",
        rename = "notification_poll_interval_secs"
    )]
    #[serde_as(as = "DurationSeconds")]
    pub notification_poll_interval: Duration,
}

impl Default for ManagementSettings {
    fn default() -> Self {
        Self {
            scheme: Self::default_scheme(),
            host: Self::default_host(),
            port: Self::DEFAULT_PORT,
            base_path: Self::default_base_path(),
            domain: Self::default_domain(),
            credentials: None,
            headers: Vec::default(),
            max_retries: Self::DEFAULT_MAX_RETRIES,
            pool_idle_timeout: None,
            pool_max_idle_per_host: None,
            document_host: None,
            document_port: None,
            notification_poll_interval: Self::DEFAULT_NOTIFICATION_POLL_INTERVAL,
        }
    }
}

impl ManagementSettings {
    const DEFAULT_BASE_PATH: &'static str = "streams/rest";
    const DEFAULT_DOMAIN: &'static str = "StreamsDomain";
    const DEFAULT_HOST: &'static str = "localhost";
    const DEFAULT_MAX_RETRIES: u32 = 3;
    const DEFAULT_NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_secs(10);
    const DEFAULT_PORT: u16 = 8443;
    const DEFAULT_SCHEME: &'static str = "https";

    pub fn default_scheme() -> String {
        Self::DEFAULT_SCHEME.to_string()
    }

    pub fn default_host() -> String {
        Self::DEFAULT_HOST.to_string()
    }

    pub const fn default_port() -> u16 {
        Self::DEFAULT_PORT
    }

    pub fn default_base_path() -> String {
        Self::DEFAULT_BASE_PATH.to_string()
    }

    pub fn default_domain() -> String {
        Self::DEFAULT_DOMAIN.to_string()
    }

    pub const fn default_max_retries() -> u32 {
        Self::DEFAULT_MAX_RETRIES
    }

    pub const fn default_notification_poll_interval() -> Duration {
        Self::DEFAULT_NOTIFICATION_POLL_INTERVAL
    }

    pub fn header_map(&self) -> Result<HeaderMap, SettingsError> {
        let mut result = HeaderMap::with_capacity(self.headers.len());

        for (k, v) in self.headers.iter() {
            let name = HeaderName::from_str(k.as_str())?;
            let value = HeaderValue::from_str(v.as_str())?;
            result.insert(name, value);
        }

        Ok(result)
    }

    /// Root of the management REST interface, always ending in a slash so relative joins stay
    /// under the base path.
    pub fn base_url(&self) -> Result<Url, url::ParseError> {
        let base_path = self.base_path.trim_matches('/');
        let rep = if base_path.is_empty() {
            format!("{}://{}:{}/", self.scheme, self.host, self.port)
        } else {
            format!("{}://{}:{}/{}/", self.scheme, self.host, self.port, base_path)
        };
        Url::parse(rep.as_str())
    }
}
