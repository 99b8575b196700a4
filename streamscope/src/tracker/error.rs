use thiserror::Error;

use crate::exporter::ExporterError;
use crate::management::{BeanSourceError, WebClientError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("failed to initialize tracker for domain {domain}: {source}")]
    Initialization {
        domain: String,
        #[source]
        source: Box<TrackerError>,
    },

    #[error("{0}")]
    Remote(BeanSourceError),

    #[error("{0}")]
    WebClient(#[from] WebClientError),

    #[error("{0}")]
    Exporter(#[from] ExporterError),

    #[error("{document} document for instance {instance} does not match the expected schema: {source}")]
    Schema {
        instance: String,
        document: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} handle has not been acquired")]
    MissingHandle(&'static str),
}

impl From<BeanSourceError> for TrackerError {
    fn from(error: BeanSourceError) -> Self {
        Self::Remote(error.unwrap_undeclared())
    }
}

impl TrackerError {
    /// Recoverable failures put the tracker into its unavailable state; the next refresh cycle
    /// starts over from initialization.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Remote(err) => err.is_recoverable(),
            Self::WebClient(err) => err.is_recoverable(),
            Self::MissingHandle(_) => true,
            Self::Initialization { .. } | Self::Exporter(_) | Self::Schema { .. } => false,
        }
    }

    /// A fatal failure means the remote contract changed or the tracker could never start. There
    /// is no point in carrying on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Initialization { .. } | Self::Schema { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote(err) if err.is_not_found())
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Initialization { .. } => "tracker::initialization",
            Self::Remote(err) => err.label(),
            Self::WebClient(err) => err.label(),
            Self::Exporter(err) => err.label(),
            Self::Schema { .. } => "tracker::schema",
            Self::MissingHandle(_) => "tracker::missing_handle",
        }
    }
}
