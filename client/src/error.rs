use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Object metadata is missing: {0}")]
    ObjectMetaMissing(&'static str),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    BuildRequest(#[from] kube::core::request::Error),
    #[error(transparent)]
    Api(#[from] kube::core::ErrorResponse),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("request timed out")]
    Timeout,
    #[error("{0} is not mapped to a resource")]
    GvkNotMapped(String),
    #[error("resource {0} is not mapped to a kind")]
    ResourceNotMapped(String),
    #[error("cluster is unhealthy")]
    Unhealthy,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
