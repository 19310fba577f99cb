//! Fatal harness errors.

use std::io;

use crate::{
    body::BodyError, client::DriverError, fixtures::EnumerationError, size::StatError,
};

/// Errors that end a run before its outcome can be checked.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The harness server could not be started.
    #[error("failed to start harness server: {0}")]
    Bind(#[source] io::Error),

    /// The fixture root could not be walked.
    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    /// A fixture could not be stat'd.
    #[error(transparent)]
    Stat(#[from] StatError),

    /// A fixture became unreadable while streaming.
    #[error(transparent)]
    StreamRead(#[from] BodyError),

    /// The connection failed.
    #[error("connection error: {0}")]
    Connection(#[source] DriverError),
}

impl From<DriverError> for HarnessError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Body(err) => Self::StreamRead(err),
            other => Self::Connection(other),
        }
    }
}
