use std::path::PathBuf;

use thiserror::Error;

use crate::model::SessionId;

#[derive(Debug, Error)]
pub enum ExportError {
    /// A precondition was not met. Raised before any session is opened.
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error("ParsingError: {path}: {reason}")]
    Parsing { path: PathBuf, reason: String },

    /// The batch could not be submitted at all. Ordinary rejections are
    /// reported through `SendOutcome::failed` instead.
    #[error("DeliveryError: {0}")]
    Delivery(String),

    #[error("StorageError: {0}")]
    Storage(String),

    /// Outward-facing wrapper for anything that failed after a session was opened.
    #[error("ProcessingError: session {session_id} aborted")]
    Processing {
        session_id: SessionId,
        #[source]
        source: Box<ExportError>,
    },
}

impl ExportError {
    pub fn parsing(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ExportError::Parsing {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn processing(session_id: SessionId, cause: ExportError) -> Self {
        ExportError::Processing {
            session_id,
            source: Box::new(cause),
        }
    }

    /// The innermost cause, looking through `Processing` wrappers.
    pub fn root(&self) -> &ExportError {
        match self {
            ExportError::Processing { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for ExportError {
    fn from(error: anyhow::Error) -> Self {
        ExportError::Storage(format!("{:#}", error))
    }
}
