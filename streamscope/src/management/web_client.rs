use std::fmt::Debug;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Method, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use secrecy::ExposeSecret;
use thiserror::Error;
use tracing::Instrument;
use url::Url;

use crate::settings::{Credentials, ManagementSettings};

#[derive(Debug, Error)]
pub enum WebClientError {
    #[error("invalid document uri {uri}: {source}")]
    Uri {
        uri: String,
        #[source]
        source: url::ParseError,
    },

    #[error("cannot direct document uri {0} to the configured host or port")]
    Redirect(Url),

    #[error("document request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("error occurred in HTTP middleware retrieving document: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("document request to {url} responded with {status}")]
    HttpStatus { status: StatusCode, url: Url },
}

impl WebClientError {
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Uri { .. } | Self::Redirect(_))
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Uri { .. } | Self::Redirect(_) => "web::url",
            Self::HttpRequest(_) => "web::request",
            Self::HttpMiddleware(_) => "web::middleware",
            Self::HttpStatus { .. } => "web::status",
        }
    }
}

/// Retrieves the large bulk documents whose location the management server hands out.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WebClient: Debug + Send + Sync {
    async fn get(&self, uri: &str) -> Result<String, WebClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpWebClient {
    client: ClientWithMiddleware,
    host: Option<String>,
    port: Option<u16>,
    credentials: Option<Credentials>,
}

impl HttpWebClient {
    pub const fn new(
        client: ClientWithMiddleware, host: Option<String>, port: Option<u16>, credentials: Option<Credentials>,
    ) -> Self {
        Self { client, host, port, credentials }
    }

    pub fn from_settings(client: ClientWithMiddleware, settings: &ManagementSettings) -> Self {
        Self::new(
            client,
            settings.document_host.clone(),
            settings.document_port,
            settings.credentials.clone(),
        )
    }

    /// Documents are often published under a host name only resolvable inside the cluster, so the
    /// configured host and port take precedence over those in the uri.
    fn target_url(&self, uri: &str) -> Result<Url, WebClientError> {
        let mut url =
            Url::parse(uri).map_err(|source| WebClientError::Uri { uri: uri.to_string(), source })?;

        if let Some(ref host) = self.host {
            url.set_host(Some(host.as_str()))
                .map_err(|source| WebClientError::Uri { uri: uri.to_string(), source })?;
        }

        if let Some(port) = self.port {
            if url.set_port(Some(port)).is_err() {
                return Err(WebClientError::Redirect(url));
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl WebClient for HttpWebClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, uri: &str) -> Result<String, WebClientError> {
        let url = self.target_url(uri)?;
        let mut request = self.client.request(Method::GET, url.clone());
        if let Some(ref credentials) = self.credentials {
            request = request.basic_auth(
                credentials.username.as_str(),
                Some(credentials.password.expose_secret()),
            );
        }

        let span = tracing::debug_span!("retrieve bulk document", %url);
        let response = request.send().instrument(span.clone()).await?;
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(?response, "bulk document request failed");
            return Err(WebClientError::HttpStatus { status, url });
        }

        let body = response.text().instrument(span).await?;
        Ok(body)
    }
}
