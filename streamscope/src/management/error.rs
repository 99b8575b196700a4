use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum BeanSourceError {
    #[error("{entity} not found on management server: {name}")]
    NotFound { entity: &'static str, name: String },

    #[error("management server connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("management server connection is no longer usable: {0}")]
    Disconnected(String),

    #[error("management REST call failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("error occurred in HTTP middleware calling management server: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    #[error("management server responded with {status} to {url}")]
    HttpStatus { status: StatusCode, url: Url },

    #[error("failed processing management JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid management url: {0}")]
    Url(#[from] url::ParseError),

    #[error("supplied management url cannot be a base to query: {0}")]
    NotABaseUrl(Url),

    #[error("invalid management request header: {0}")]
    InvalidRequestHeader(String),

    /// A failure reported by the remote layer inside an opaque wrapper; classify through
    /// [`BeanSourceError::unwrap_undeclared`].
    #[error("undeclared management failure: {0}")]
    Undeclared(#[source] Box<BeanSourceError>),
}

impl BeanSourceError {
    pub fn not_found(entity: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { entity, name: name.into() }
    }

    pub fn undeclared(cause: Self) -> Self {
        Self::Undeclared(Box::new(cause))
    }

    /// Strips any undeclared wrappers, returning the underlying classified failure.
    pub fn unwrap_undeclared(self) -> Self {
        match self {
            Self::Undeclared(cause) => cause.unwrap_undeclared(),
            err => err,
        }
    }

    fn root(&self) -> &Self {
        match self {
            Self::Undeclared(cause) => cause.root(),
            err => err,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::NotFound { .. })
    }

    /// Transient failures leave the tracker unavailable until a later cycle succeeds; everything
    /// else indicates a contract or configuration problem.
    pub fn is_recoverable(&self) -> bool {
        match self.root() {
            Self::NotFound { .. }
            | Self::Io(_)
            | Self::Disconnected(_)
            | Self::HttpRequest(_)
            | Self::HttpMiddleware(_)
            | Self::HttpStatus { .. } => true,
            Self::Json(_) | Self::Url(_) | Self::NotABaseUrl(_) | Self::InvalidRequestHeader(_) => false,
            Self::Undeclared(_) => false,
        }
    }

    /// Whether the failure indicates the connection itself is broken, as opposed to the request.
    pub fn is_connection_failure(&self) -> bool {
        match self.root() {
            Self::Io(_) | Self::Disconnected(_) => true,
            Self::HttpRequest(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            Self::HttpMiddleware(reqwest_middleware::Error::Reqwest(err)) => {
                err.is_connect() || err.is_timeout() || err.is_request()
            },
            Self::HttpMiddleware(_) => true,
            _ => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.root() {
            Self::NotFound { .. } => "management::not_found",
            Self::Io(_) => "management::io",
            Self::Disconnected(_) => "management::disconnected",
            Self::HttpRequest(_) => "management::http::request",
            Self::HttpMiddleware(_) => "management::http::middleware",
            Self::HttpStatus { .. } => "management::http::status",
            Self::Json(_) => "management::http::json",
            Self::Url(_) | Self::NotABaseUrl(_) => "management::http::url",
            Self::InvalidRequestHeader(_) => "management::http::header",
            Self::Undeclared(_) => "management::undeclared",
        }
    }
}
