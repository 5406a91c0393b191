use thiserror::Error;

use crate::config::{BackendKind, Config, Placement};
use crate::messages::Message;

use super::forbidden::{is_forbidden, normalize_tag, parse_forbidden};

/// Stand-in for an escaped `\\` while brackets are being swapped.
const PROTECTED_BACKSLASH: char = '\u{E000}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPrompt {
    pub positive: String,
    pub negative: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromptRejection {
    #[error("prompt contains non-latin characters")]
    LatinOnly,
    #[error("prompt exceeds the configured word limit")]
    TooManyWords,
}

impl From<PromptRejection> for Message {
    fn from(rejection: PromptRejection) -> Self {
        match rejection {
            PromptRejection::LatinOnly => Message::LatinOnly,
            PromptRejection::TooManyWords => Message::TooManyWords,
        }
    }
}

/// Turns free chat text into a positive / negative prompt pair for the
/// configured backend.
pub fn normalize_prompt(
    input: &str,
    config: &Config,
    override_defaults: bool,
) -> Result<NormalizedPrompt, PromptRejection> {
    let lists = TagLists::new(config);
    if input.trim().is_empty() {
        let mut positive = Vec::new();
        lists.append(&mut positive, &config.base_prompt, Placement::After);
        lists.append(&mut positive, &config.default_prompt, Placement::After);
        return Ok(NormalizedPrompt {
            positive: positive.join(", "),
            negative: config.negative_prompt.trim().to_string(),
        });
    }

    let mut text = convert_fullwidth(input);
    text = swap_brackets(&text, config.backend);
    text = text.replace(PROTECTED_BACKSLASH, "\\").replace('_', " ");

    if config.latin_only && text.chars().any(|ch| !is_latin(ch)) {
        return Err(PromptRejection::LatinOnly);
    }

    let mut negative = Vec::new();
    if let Some((cut, remainder)) = find_negative_marker(&text) {
        lists.append(&mut negative, remainder, config.placement);
        text = text[..cut].trim().to_string();
    }

    let forbidden = parse_forbidden(&config.forbidden);
    let mut positive: Vec<String> = split_tags(&text)
        .filter(|tag| {
            let normalized = normalize_tag(tag);
            !normalized.is_empty() && !is_forbidden(&normalized, &forbidden)
        })
        .map(|tag| {
            if is_angle_tag(tag) {
                tag.replace(' ', "_")
            } else if config.lower_case {
                tag.to_lowercase()
            } else {
                tag.to_string()
            }
        })
        .collect();

    if config.max_words > 0 && word_count(&positive) + word_count(&negative) > config.max_words {
        return Err(PromptRejection::TooManyWords);
    }

    if !override_defaults {
        lists.append(&mut positive, &config.base_prompt, config.placement);
        lists.append(&mut negative, &config.negative_prompt, config.placement);
        if config.default_prompt_enabled {
            lists.append(&mut positive, &config.default_prompt, config.placement);
        }
    }

    Ok(NormalizedPrompt {
        positive: positive.join(", "),
        negative: negative.join(", "),
    })
}

struct TagLists {
    lower_case: bool,
}

impl TagLists {
    fn new(config: &Config) -> Self {
        Self {
            lower_case: config.lower_case,
        }
    }

    /// Adds the comma-separated `input` tags that `words` does not hold yet.
    /// `Before` prepends them while keeping their own order.
    fn append(&self, words: &mut Vec<String>, input: &str, placement: Placement) {
        let mut tags: Vec<&str> = split_tags(input).collect();
        if placement == Placement::Before {
            tags.reverse();
        }
        for tag in tags {
            let tag = if self.lower_case {
                tag.to_lowercase()
            } else {
                tag.to_string()
            };
            let lowered = tag.to_lowercase();
            if words.iter().any(|word| word.to_lowercase() == lowered) {
                continue;
            }
            match placement {
                Placement::Before => words.insert(0, tag),
                Placement::After => words.push(tag),
            }
        }
    }
}

fn split_tags(input: &str) -> impl Iterator<Item = &str> {
    input.split(',').map(str::trim).filter(|tag| !tag.is_empty())
}

fn is_angle_tag(tag: &str) -> bool {
    tag.len() > 2 && tag.starts_with('<') && tag.ends_with('>')
}

fn convert_fullwidth(input: &str) -> String {
    input
        .replace("\\\\", &PROTECTED_BACKSLASH.to_string())
        .chars()
        .map(|ch| match ch {
            '，' => ',',
            '（' => '(',
            '）' => ')',
            '《' => '<',
            '》' => '>',
            other => other,
        })
        .collect()
}

/// SD-WebUI reads `()` as emphasis and every other backend reads `{}`, so
/// unescaped brackets of the foreign kind are rewritten.
fn swap_brackets(input: &str, backend: BackendKind) -> String {
    let (from_open, from_close, to_open, to_close) = if backend.uses_paren_emphasis() {
        ('{', '}', '(', ')')
    } else {
        ('(', ')', '{', '}')
    };
    let mut out = String::with_capacity(input.len());
    let mut escaped = false;
    for ch in input.chars() {
        let mapped = match ch {
            _ if escaped => ch,
            c if c == from_open => to_open,
            c if c == from_close => to_close,
            c => c,
        };
        escaped = ch == '\\';
        out.push(mapped);
    }
    out
}

fn is_latin(ch: char) -> bool {
    ch.is_whitespace()
        || ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '_' | '"'
                | '\''
                | '“'
                | '”'
                | '‘'
                | '’'
                | '.'
                | ','
                | ':'
                | '|'
                | '\\'
                | '('
                | ')'
                | '['
                | ']'
                | '{'
                | '}'
                | '<'
                | '>'
                | '-'
        )
}

/// Finds the first `, -u ...`, ` --undesired ...` or ` negative prompt: ...`
/// marker. Returns the byte offset where the positive part ends and the
/// negative remainder.
fn find_negative_marker(text: &str) -> Option<(usize, &str)> {
    for (start, ch) in text.char_indices() {
        if ch != ',' && !ch.is_whitespace() {
            continue;
        }
        let after_separator = text[start + ch.len_utf8()..].trim_start();
        if let Some(remainder) = strip_marker(after_separator) {
            if !remainder.is_empty() {
                return Some((start, remainder));
            }
        }
    }
    None
}

fn strip_marker(text: &str) -> Option<&str> {
    for marker in ["-u", "--undesired"] {
        if let Some(rest) = text.strip_prefix(marker) {
            if rest.starts_with(char::is_whitespace) {
                return Some(rest.trim_start());
            }
        }
    }
    for marker in ["negative prompts:", "negative prompt:"] {
        if let Some(rest) = text.strip_prefix(marker) {
            return Some(rest.trim_start());
        }
    }
    None
}

fn word_count(words: &[String]) -> usize {
    let joined = words.join(" ").to_lowercase();
    joined
        .split(|ch: char| !(ch.is_ascii_lowercase() || ch.is_ascii_digit()))
        .filter(|word| !word.is_empty())
        .count()
}
