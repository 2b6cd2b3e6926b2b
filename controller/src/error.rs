use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Sentinel returned by a handler to skip an object on purpose: the key
    /// is not retried and the execution is not counted as a failure.
    #[error("ignore")]
    Ignore,
    /// Wraps an error that must not be retried.
    #[error(transparent)]
    Permanent(Box<Error>),
    #[error(transparent)]
    Client(#[from] lariat_client::Error),
    #[error(transparent)]
    Cache(#[from] lariat_cache::Error),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
    #[error("{0} requires at least one worker")]
    NoWorkers(String),
    #[error("failed to sync caches: {0}")]
    CacheSync(String),
}

impl Error {
    pub fn msg(message: impl ToString) -> Self {
        Self::Message(message.to_string())
    }

    pub fn permanent(err: impl Into<Error>) -> Self {
        Self::Permanent(Box::new(err.into()))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, Error::Ignore)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
