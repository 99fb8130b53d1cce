use crucible_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Sandbox(#[from] crucible_sandbox::Error),
    #[error(transparent)]
    Runs(#[from] crucible_runs::Error),
    /// Failure of an LLM provider or other thin I/O adapter.
    #[error(transparent)]
    Upstream(#[from] anyhow::Error),
    #[error("Sandbox execution is not available for user {user_id}.")]
    SandboxNotEntitled { user_id: String },
    #[error("Package install failed: {output}")]
    PackageInstall { output: String },
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
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

crucible_common::impl_context!();
