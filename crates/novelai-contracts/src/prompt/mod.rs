mod forbidden;
mod normalizer;

pub use forbidden::{is_forbidden, normalize_tag, parse_forbidden, ForbiddenPattern};
pub use normalizer::{normalize_prompt, NormalizedPrompt, PromptRejection};
