//! Errors surfaced by the quiz engine. All of them are recoverable: the
//! caller re-prompts the user and the session is left as it was.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuizError {
    #[error("no subject selected")]
    NoSubjectSelected,

    #[error("profile subject {0:?} is already selected")]
    DuplicateProfileSubject(String),

    #[error("free generation quota exceeded ({limit} per window)")]
    QuotaExceeded { limit: usize },

    #[error("question generation for {subject:?} failed: {cause}")]
    GenerationTransientFailure {
        subject: String,
        cause: GenerationCause,
    },

    #[error("{0:?} is not one of A, B, C, D")]
    InvalidAnswerInput(String),

    #[error("unknown subject choice {0:?}")]
    UnknownSubjectChoice(String),

    #[error("questions are still being generated")]
    GenerationInProgress,

    #[error("generated questions belong to a session that was reset")]
    GenerationSuperseded,

    #[error("action is not available while {stage}")]
    UnexpectedAction { stage: &'static str },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why a generator call did not produce text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationCause {
    Generator(String),
    TimedOut(Duration),
}

impl fmt::Display for GenerationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationCause::Generator(message) => write!(f, "generator error: {message}"),
            GenerationCause::TimedOut(after) => {
                write!(f, "timed out after {}s", after.as_secs())
            }
        }
    }
}
