use novelai_contracts::messages::Message;
use thiserror::Error;

/// Failure of one backend exchange.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// HTTP 402: bad credentials or not enough credits.
    #[error("backend refused the request: unauthorized or out of credits")]
    Unauthorized,
    #[error("backend responded with status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    /// Connection-level failure, identified by an errno-style code.
    #[error("transport error ({code})")]
    Transport { code: String },
    /// A failure that already has a user-facing message.
    #[error("{0}")]
    Rejected(Message),
    #[error("backend returned an empty image")]
    EmptyResponse,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GenerationError {
    pub fn transport(code: impl Into<String>) -> Self {
        GenerationError::Transport { code: code.into() }
    }

    /// Only transport failures are retried; timeouts and HTTP statuses are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Transport { .. })
    }

    /// Errors that map to a specific reply rather than `.unknown-error`.
    pub fn is_handled(&self) -> bool {
        !matches!(self, GenerationError::Other(_))
    }

    pub fn to_message(&self) -> Message {
        match self {
            GenerationError::Unauthorized => Message::Unauthorized,
            GenerationError::Status(code) => Message::ResponseError(*code),
            GenerationError::Timeout => Message::RequestTimeout,
            GenerationError::Transport { code } => Message::RequestFailed(code.clone()),
            GenerationError::Rejected(message) => message.clone(),
            GenerationError::EmptyResponse => Message::EmptyResponse,
            GenerationError::Other(_) => Message::UnknownError,
        }
    }
}

impl From<Message> for GenerationError {
    fn from(message: Message) -> Self {
        GenerationError::Rejected(message)
    }
}
