use crucible_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error("Unknown MCP tool: {name}")]
    UnknownTool { name: String },
    #[error("MCP server \"{server}\" is not connected.")]
    NotConnected { server: String },
    #[error("MCP tool call failed: {detail}")]
    CallFailed { detail: String },
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
    pub fn call_failed(detail: impl std::fmt::Display) -> Self {
        Self::CallFailed {
            detail: detail.to_string(),
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
