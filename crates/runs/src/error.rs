use {crate::types::RunStatus, crucible_common::FromMessage};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run step not found: {step_id}")]
    StepNotFound { step_id: String },

    #[error("invalid run status transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("run store error: {message}")]
    Store { message: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn run_not_found(run_id: impl Into<String>) -> Self {
        Self::RunNotFound {
            run_id: run_id.into(),
        }
    }

    #[must_use]
    pub fn step_not_found(step_id: impl Into<String>) -> Self {
        Self::StepNotFound {
            step_id: step_id.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

crucible_common::impl_context!();
