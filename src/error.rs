use thiserror::Error;

/// Boxed error from the document-store client, carried without rewriting.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The store rejected or failed the aggregation request.
    #[error(transparent)]
    Execution(BoxError),

    /// Draining or decoding the result cursor failed.
    #[error(transparent)]
    Decode(BoxError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid grouping query: {0}")]
    InvalidConfig(String),

    #[error("missing environment variable: {0}")]
    MissingEnv(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn execution<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Execution(Box::new(err))
    }

    pub(crate) fn decode<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Decode(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
