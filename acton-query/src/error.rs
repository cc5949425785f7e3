//! Crate-level error type

use thiserror::Error;

use crate::repository::QueryError;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors outside a single query: configuration, setup and I/O
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// A query failed
    #[error(transparent)]
    Query(#[from] QueryError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Query(QueryError::from(err))
    }
}

impl Error {
    /// Whether retrying the failed call may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Query(e) => e.is_retriable(),
            Self::Config(_) | Self::Io(_) | Self::Internal(_) => false,
        }
    }
}
