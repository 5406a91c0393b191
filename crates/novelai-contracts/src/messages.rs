use thiserror::Error;

/// Every user-facing reply the plugin can produce. `key()` is the locale key
/// a host i18n store would look up; `Display` is the built-in English text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Message {
    #[error("Usage: novelai <prompt> [-r portrait|landscape|square|WxH] [-s sampler] [-x seed] [-t steps] [-c scale] [-o minimal|default|verbose]")]
    Help,
    #[error("You do not have permission to use this command.")]
    LowAuthority,
    #[error("Drawing, please wait...")]
    Waiting,
    #[error("Queued behind {0} running task(s), please wait...")]
    Pending(usize),
    #[error("Too many jobs are running in this channel, please try again later.")]
    ConcurrentJobs,
    #[error("Iterations times batch size may not exceed {0}.")]
    ExceedMaxIteration(u32),
    #[error("Please provide an image.")]
    ExpectImage,
    #[error("Please provide a prompt.")]
    ExpectPrompt,
    #[error("The input contains unsupported content.")]
    InvalidContent,
    #[error("Only one image may be provided.")]
    TooManyImages,
    #[error("Custom resolutions are not available.")]
    CustomResolutionUnsupported,
    #[error("Invalid resolution.")]
    InvalidResolution,
    #[error("Enhance only accepts images generated at a standard resolution.")]
    InvalidSize,
    #[error("Only latin characters are accepted.")]
    LatinOnly,
    #[error("The prompt contains too many words.")]
    TooManyWords,
    #[error("Failed to download the image.")]
    DownloadError,
    #[error("The image is too large.")]
    FileTooLarge,
    #[error("Unsupported image type.")]
    UnsupportedFileType,
    #[error("The configured token is invalid.")]
    InvalidToken,
    #[error("The configured email or password is invalid.")]
    InvalidPassword,
    #[error("Unauthorized, or not enough credits left.")]
    Unauthorized,
    #[error("The server responded with status {0}.")]
    ResponseError(u16),
    #[error("The request timed out.")]
    RequestTimeout,
    #[error("The request failed ({0}).")]
    RequestFailed(String),
    #[error("The server returned an empty image.")]
    EmptyResponse,
    #[error("An unknown error occurred.")]
    UnknownError,
    #[error("Unknown option {0}.")]
    UnknownOption(String),
    #[error("Invalid value '{value}' for option {option}.")]
    InvalidOption { option: String, value: String },
}

impl Message {
    pub fn key(&self) -> &'static str {
        match self {
            Message::Help => "help",
            Message::LowAuthority => "internal.low-authority",
            Message::Waiting => ".waiting",
            Message::Pending(_) => ".pending",
            Message::ConcurrentJobs => ".concurrent-jobs",
            Message::ExceedMaxIteration(_) => ".exceed-max-iteration",
            Message::ExpectImage => ".expect-image",
            Message::ExpectPrompt => ".expect-prompt",
            Message::InvalidContent => ".invalid-content",
            Message::TooManyImages => ".too-many-images",
            Message::CustomResolutionUnsupported => ".custom-resolution-unsupported",
            Message::InvalidResolution => ".invalid-resolution",
            Message::InvalidSize => ".invalid-size",
            Message::LatinOnly => ".latin-only",
            Message::TooManyWords => ".too-many-words",
            Message::DownloadError => ".download-error",
            Message::FileTooLarge => ".file-too-large",
            Message::UnsupportedFileType => ".unsupported-file-type",
            Message::InvalidToken => ".invalid-token",
            Message::InvalidPassword => ".invalid-password",
            Message::Unauthorized => ".unauthorized",
            Message::ResponseError(_) => ".response-error",
            Message::RequestTimeout => ".request-timeout",
            Message::RequestFailed(_) => ".request-failed",
            Message::EmptyResponse => ".empty-response",
            Message::UnknownError => ".unknown-error",
            Message::UnknownOption(_) => "internal.unknown-option",
            Message::InvalidOption { .. } => "internal.invalid-option",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Message;

    #[test]
    fn keys_and_text_carry_parameters() {
        assert_eq!(Message::TooManyWords.key(), ".too-many-words");
        assert_eq!(Message::ResponseError(500).key(), ".response-error");
        assert_eq!(
            Message::ResponseError(500).to_string(),
            "The server responded with status 500."
        );
        assert_eq!(
            Message::RequestFailed("ECONNRESET".to_string()).to_string(),
            "The request failed (ECONNRESET)."
        );
    }
}
