use kestrel_storage::StorageError;
use snafu::Snafu;

use crate::chat::message::{EngineState, MessageId};

/// Coarse error taxonomy callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    State,
    Storage,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("`{stage}` requires non-empty text"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("message {message_id} is not part of the active session"))]
    UnknownMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("session '{session}' is not known"))]
    UnknownSession {
        stage: &'static str,
        session: String,
    },
    #[snafu(display("`{operation}` is not allowed while the engine is {state:?}"))]
    InvalidState {
        stage: &'static str,
        operation: &'static str,
        state: EngineState,
    },
    #[snafu(display("nothing to regenerate: {details}"))]
    NothingToRegenerate {
        stage: &'static str,
        details: &'static str,
    },
    #[snafu(display("local storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput { .. } | Self::UnknownMessage { .. } | Self::UnknownSession { .. } => {
                ErrorKind::Validation
            }
            Self::InvalidState { .. } | Self::NothingToRegenerate { .. } => ErrorKind::State,
            Self::Storage { .. } => ErrorKind::Storage,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
