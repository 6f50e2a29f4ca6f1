//! Errors for the shared link plumbing

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The event channel was closed by the other side
    #[error("Event channel error: {0}")]
    Channel(String),

    #[error("Invalid log filter: {0}")]
    LogFilter(String),

    #[error("Logging already initialized: {0}")]
    LoggingInit(String),
}

pub type Result<T> = std::result::Result<T, Error>;
