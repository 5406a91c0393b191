use thiserror::Error;

use crate::capabilities::{lookup, resolve_nai_model, NAI3_SAMPLERS, NAI_SAMPLERS};
use crate::config::{BackendKind, Config, OutputMode};
use crate::messages::Message;
use crate::resolution::{parse_resolution, Size};

use super::command_registry::{find_option, CommandSpec, OptionKey, GENERATE_COMMANDS, SLASH_COMMANDS};

/// One line of chat text, classified before any config is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatLine {
    Noop,
    Generate { enhance: bool, body: String },
    Meta { action: &'static str, arg: String },
    Unknown { command: String, arg: String },
    /// Plain conversation not addressed to the bot.
    Chatter(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOptions {
    pub enhance: bool,
    pub model: Option<String>,
    pub resolution: Option<Size>,
    pub output: Option<OutputMode>,
    pub override_defaults: bool,
    pub sampler: Option<String>,
    pub seed: Option<u64>,
    pub steps: Option<u32>,
    pub scale: Option<f64>,
    pub noise: Option<f64>,
    pub strength: Option<f64>,
    pub hires_fix: bool,
    pub smea: bool,
    pub smea_dyn: bool,
    pub scheduler: Option<String>,
    pub decrisper: bool,
    pub no_translator: bool,
    pub iterations: Option<u32>,
    pub batch: Option<u32>,
}

impl CommandOptions {
    /// Keeps only what a low-authority user may set.
    pub fn resolution_only(&self) -> Self {
        Self {
            resolution: self.resolution,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    /// Prompt text with flags and image elements removed.
    pub input: String,
    /// `src` of every `<img>` element, in order of appearance.
    pub images: Vec<String>,
    pub options: CommandOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("unknown option {0}")]
    Unknown(String),
    #[error("option {0} expects a value")]
    MissingValue(String),
    #[error("invalid value '{value}' for option {option}")]
    InvalidValue { option: String, value: String },
    #[error("invalid resolution '{0}'")]
    Resolution(String),
}

impl From<OptionError> for Message {
    fn from(err: OptionError) -> Self {
        match err {
            OptionError::Unknown(option) => Message::UnknownOption(option),
            OptionError::MissingValue(option) => Message::InvalidOption {
                option,
                value: String::new(),
            },
            OptionError::InvalidValue { option, value } => Message::InvalidOption { option, value },
            OptionError::Resolution(_) => Message::InvalidResolution,
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

pub fn parse_chat_line(text: &str) -> ChatLine {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return ChatLine::Noop;
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim().to_string();
            if let Some(action) = find_action(&command, SLASH_COMMANDS) {
                return ChatLine::Meta { action, arg };
            }
            return ChatLine::Unknown { command, arg };
        }
    }

    let head_len = raw_trimmed
        .find(char::is_whitespace)
        .unwrap_or(raw_trimmed.len());
    let head = raw_trimmed[..head_len].to_lowercase();
    match find_action(&head, GENERATE_COMMANDS) {
        Some(action) => ChatLine::Generate {
            enhance: action == "enhance",
            body: raw_trimmed[head_len..].trim().to_string(),
        },
        None => ChatLine::Chatter(raw_trimmed.to_string()),
    }
}

/// Splits a command body into prompt text, image sources and flags. Flags the
/// configured backend does not register are rejected as unknown; any other
/// dash-word (such as `-u`) stays in the prompt.
pub fn parse_invocation(body: &str, config: &Config) -> Result<Invocation, OptionError> {
    let capabilities = config.backend.capabilities();
    let (text, images) = extract_images(body);
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut options = CommandOptions::default();
    let mut prompt: Vec<&str> = Vec::new();

    let mut index = 0;
    while index < tokens.len() {
        let token = tokens[index];
        index += 1;
        let (flag, inline) = match token.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag, Some(value)),
            _ => (token, None),
        };
        let Some(spec) = find_option(flag) else {
            prompt.push(token);
            continue;
        };
        if !spec.key.is_supported(capabilities) {
            return Err(OptionError::Unknown(flag.to_string()));
        }
        let value = match (spec.value, inline) {
            (None, _) => None,
            (Some(_), Some(value)) => Some(value),
            (Some(_), None) => {
                let value = tokens
                    .get(index)
                    .copied()
                    .ok_or_else(|| OptionError::MissingValue(flag.to_string()))?;
                index += 1;
                Some(value)
            }
        };
        apply_option(&mut options, spec.key, flag, value.unwrap_or(""), config)?;
    }

    Ok(Invocation {
        input: prompt.join(" "),
        images,
        options,
    })
}

fn apply_option(
    options: &mut CommandOptions,
    key: OptionKey,
    flag: &str,
    value: &str,
    config: &Config,
) -> Result<(), OptionError> {
    let invalid = || OptionError::InvalidValue {
        option: flag.to_string(),
        value: value.to_string(),
    };
    match key {
        OptionKey::Enhance => options.enhance = true,
        OptionKey::Override => options.override_defaults = true,
        OptionKey::HiresFix => options.hires_fix = true,
        OptionKey::Smea => options.smea = true,
        OptionKey::SmeaDyn => options.smea_dyn = true,
        OptionKey::Decrisper => options.decrisper = true,
        OptionKey::NoTranslator => options.no_translator = true,
        OptionKey::Model => {
            if !config.backend.is_third_party() && resolve_nai_model(value).is_none() {
                return Err(invalid());
            }
            options.model = Some(value.to_string());
        }
        OptionKey::Resolution => {
            let size = parse_resolution(value, config.max_resolution)
                .map_err(|_| OptionError::Resolution(value.to_string()))?;
            options.resolution = Some(size);
        }
        OptionKey::Output => options.output = Some(OutputMode::parse(value).ok_or_else(invalid)?),
        OptionKey::Sampler => {
            if !is_known_sampler(config.backend, value) {
                return Err(invalid());
            }
            options.sampler = Some(value.to_string());
        }
        OptionKey::Seed => options.seed = Some(value.parse().map_err(|_| invalid())?),
        OptionKey::Steps => {
            let steps = parse_positive(value).ok_or_else(invalid)?;
            if config.max_steps > 0 && steps > config.max_steps {
                return Err(invalid());
            }
            options.steps = Some(steps);
        }
        OptionKey::Scale => options.scale = Some(parse_number(value).ok_or_else(invalid)?),
        OptionKey::Noise => options.noise = Some(parse_number(value).ok_or_else(invalid)?),
        OptionKey::Strength => options.strength = Some(parse_number(value).ok_or_else(invalid)?),
        OptionKey::Scheduler => {
            let scheduler = config
                .backend
                .capabilities()
                .schedulers
                .iter()
                .find(|name| name.eq_ignore_ascii_case(value))
                .ok_or_else(invalid)?;
            options.scheduler = Some((*scheduler).to_string());
        }
        OptionKey::Iterations => {
            options.iterations = Some(parse_positive(value).ok_or_else(invalid)?)
        }
        OptionKey::Batch => options.batch = Some(parse_positive(value).ok_or_else(invalid)?),
    }
    Ok(())
}

/// NovelAI takes both sampler generations; ComfyUI also takes the NovelAI
/// names and converts them.
fn is_known_sampler(backend: BackendKind, sampler: &str) -> bool {
    let nai = || lookup(NAI_SAMPLERS, sampler).or_else(|| lookup(NAI3_SAMPLERS, sampler));
    match backend {
        BackendKind::Token | BackendKind::Login => nai().is_some(),
        BackendKind::Comfyui => {
            nai().is_some() || lookup(backend.capabilities().samplers, sampler).is_some()
        }
        _ => lookup(backend.capabilities().samplers, sampler).is_some(),
    }
}

fn parse_positive(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|parsed| *parsed > 0)
}

fn parse_number(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|parsed| parsed.is_finite())
}

/// Removes `<img .../>` (or `<image .../>`) elements and returns their sources.
fn extract_images(body: &str) -> (String, Vec<String>) {
    let mut text = String::with_capacity(body.len());
    let mut images = Vec::new();
    let mut rest = body;
    while let Some(start) = find_image_element(rest) {
        text.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail.find('>').map(|pos| pos + 1).unwrap_or(tail.len());
        if let Some(src) = attribute(&tail[..end], "src") {
            images.push(decode_entities(src));
        }
        text.push(' ');
        rest = &tail[end..];
    }
    text.push_str(rest);
    (text, images)
}

fn find_image_element(text: &str) -> Option<usize> {
    text.match_indices('<').map(|(pos, _)| pos).find(|pos| {
        let after = &text[pos + 1..];
        ["image", "img"].iter().any(|name| {
            after.len() > name.len()
                && after.as_bytes()[..name.len()].eq_ignore_ascii_case(name.as_bytes())
                && after[name.len()..]
                    .chars()
                    .next()
                    .is_some_and(|ch| ch.is_whitespace() || ch == '/' || ch == '>')
        })
    })
}

fn attribute<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{name}=");
    let (pos, _) = element.match_indices(needle.as_str()).find(|(pos, _)| {
        element[..*pos]
            .chars()
            .next_back()
            .is_some_and(char::is_whitespace)
    })?;
    let value = &element[pos + needle.len()..];
    match value.chars().next()? {
        quote @ ('"' | '\'') => {
            let inner = &value[1..];
            inner.find(quote).map(|end| &inner[..end])
        }
        _ => {
            let end = value
                .find(|ch: char| ch.is_whitespace() || ch == '>')
                .unwrap_or(value.len());
            Some(value[..end].trim_end_matches('/'))
        }
    }
}

fn decode_entities(raw: &str) -> String {
    raw.replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_chat_lines() {
        assert_eq!(parse_chat_line("   "), ChatLine::Noop);
        assert_eq!(
            parse_chat_line("NAI 1girl, smile"),
            ChatLine::Generate {
                enhance: false,
                body: "1girl, smile".to_string(),
            }
        );
        assert_eq!(
            parse_chat_line("enhance <img src=\"a.png\"/>"),
            ChatLine::Generate {
                enhance: true,
                body: "<img src=\"a.png\"/>".to_string(),
            }
        );
        assert_eq!(
            parse_chat_line("/channel  art "),
            ChatLine::Meta {
                action: "set_channel",
                arg: "art".to_string(),
            }
        );
        assert_eq!(
            parse_chat_line("/magic foo bar"),
            ChatLine::Unknown {
                command: "magic".to_string(),
                arg: "foo bar".to_string(),
            }
        );
        assert_eq!(
            parse_chat_line("novelaifan here"),
            ChatLine::Chatter("novelaifan here".to_string())
        );
    }

    #[test]
    fn parses_flags_anywhere_in_the_body() -> anyhow::Result<()> {
        let config = Config::default();
        let invocation = parse_invocation(
            "1girl, smile -r landscape --seed=42 -t 20 -c 7.5 -o verbose -u lowres",
            &config,
        )?;
        assert_eq!(invocation.input, "1girl, smile -u lowres");
        assert_eq!(invocation.options.resolution, Some(Size::new(768, 512)));
        assert_eq!(invocation.options.seed, Some(42));
        assert_eq!(invocation.options.steps, Some(20));
        assert_eq!(invocation.options.scale, Some(7.5));
        assert_eq!(invocation.options.output, Some(OutputMode::Verbose));
        Ok(())
    }

    #[test]
    fn extracts_image_elements() -> anyhow::Result<()> {
        let invocation = parse_invocation(
            "cat <img src=\"https://x.test/a.png?a=1&amp;b=2\"/> ears -e",
            &Config::default(),
        )?;
        assert_eq!(invocation.input, "cat ears");
        assert_eq!(invocation.images, vec!["https://x.test/a.png?a=1&b=2".to_string()]);
        assert!(invocation.options.enhance);
        Ok(())
    }

    #[test]
    fn flags_outside_the_backend_capabilities_are_unknown() {
        let config = Config {
            backend: BackendKind::SdWebui,
            ..Config::default()
        };
        assert_eq!(
            parse_invocation("cat -e", &config),
            Err(OptionError::Unknown("-e".to_string()))
        );
        assert!(parse_invocation("cat -H", &config).is_ok());
        assert!(parse_invocation("cat -s k_dpmpp_2m_ka", &config).is_ok());
        assert_eq!(
            parse_invocation("cat -H", &Config::default()),
            Err(OptionError::Unknown("-H".to_string()))
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let config = Config::default();
        assert_eq!(
            parse_invocation("cat -t 100", &config),
            Err(OptionError::InvalidValue {
                option: "-t".to_string(),
                value: "100".to_string(),
            })
        );
        assert_eq!(
            parse_invocation("cat -r 4096x512", &config),
            Err(OptionError::Resolution("4096x512".to_string()))
        );
        assert_eq!(
            parse_invocation("cat -m", &config),
            Err(OptionError::MissingValue("-m".to_string()))
        );
        assert!(parse_invocation("cat -m nai-v3 -C karras", &config).is_ok());
        assert!(parse_invocation("cat -m dalle", &config).is_err());
        assert!(parse_invocation("cat -C Automatic", &config).is_err());
        assert!(parse_invocation("cat -s k_dpmpp_2m", &config).is_ok());
        assert!(parse_invocation("cat -s k_dpmpp_2m_ka", &config).is_err());
        assert_eq!(
            Message::from(OptionError::Resolution("x".to_string())),
            Message::InvalidResolution
        );
    }
}
