use crucible_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error("Invalid command spec: unmatched {quote} quote")]
    UnmatchedQuote { quote: char },
    #[error("Empty command spec for {name}")]
    EmptyCommandSpec { name: String },
    #[error(
        "LOCAL_MICROVM_SSH_HOST is required for ssh transport. Configure a Linux microVM host and retry."
    )]
    MissingSshHost,
    #[error("{what} timed out after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },
    #[error("{provider} {op} failed ({code}): {detail}")]
    Provider {
        provider: &'static str,
        op: &'static str,
        code: i32,
        detail: String,
    },
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
