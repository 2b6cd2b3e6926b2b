use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] lariat_client::Error),
    #[error("object has no kind")]
    MissingTypeMeta,
    #[error("indexer {0} already exists")]
    IndexerExists(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
