use crate::capabilities::Capabilities;

#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Chat words that start a generation. `enhance` presets `-e`.
pub(crate) const GENERATE_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "novelai",
        action: "generate",
    },
    CommandSpec {
        command: "nai",
        action: "generate",
    },
    CommandSpec {
        command: "imagine",
        action: "generate",
    },
    CommandSpec {
        command: "enhance",
        action: "enhance",
    },
];

pub(crate) const SLASH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "reload",
        action: "reload",
    },
    CommandSpec {
        command: "channel",
        action: "set_channel",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptionKey {
    Enhance,
    Model,
    Resolution,
    Output,
    Override,
    Sampler,
    Seed,
    Steps,
    Scale,
    Noise,
    Strength,
    HiresFix,
    Smea,
    SmeaDyn,
    Scheduler,
    Decrisper,
    NoTranslator,
    Iterations,
    Batch,
}

impl OptionKey {
    /// Whether the flag is registered for a backend with these capabilities.
    pub fn is_supported(self, capabilities: &Capabilities) -> bool {
        match self {
            OptionKey::Enhance => capabilities.enhance,
            OptionKey::Model => capabilities.model,
            OptionKey::Noise => capabilities.noise,
            OptionKey::HiresFix => capabilities.hires_fix,
            OptionKey::Smea | OptionKey::SmeaDyn => capabilities.smea,
            OptionKey::Decrisper => capabilities.decrisper,
            OptionKey::Scheduler => !capabilities.schedulers.is_empty(),
            OptionKey::Resolution
            | OptionKey::Output
            | OptionKey::Override
            | OptionKey::Sampler
            | OptionKey::Seed
            | OptionKey::Steps
            | OptionKey::Scale
            | OptionKey::Strength
            | OptionKey::NoTranslator
            | OptionKey::Iterations
            | OptionKey::Batch => true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct OptionSpec {
    pub key: OptionKey,
    pub short: &'static str,
    pub long: &'static str,
    pub value: Option<&'static str>,
}

pub const OPTION_SPECS: &[OptionSpec] = &[
    OptionSpec {
        key: OptionKey::Enhance,
        short: "-e",
        long: "--enhance",
        value: None,
    },
    OptionSpec {
        key: OptionKey::Model,
        short: "-m",
        long: "--model",
        value: Some("model"),
    },
    OptionSpec {
        key: OptionKey::Resolution,
        short: "-r",
        long: "--resolution",
        value: Some("resolution"),
    },
    OptionSpec {
        key: OptionKey::Output,
        short: "-o",
        long: "--output",
        value: Some("minimal|default|verbose"),
    },
    OptionSpec {
        key: OptionKey::Override,
        short: "-O",
        long: "--override",
        value: None,
    },
    OptionSpec {
        key: OptionKey::Sampler,
        short: "-s",
        long: "--sampler",
        value: Some("sampler"),
    },
    OptionSpec {
        key: OptionKey::Seed,
        short: "-x",
        long: "--seed",
        value: Some("seed"),
    },
    OptionSpec {
        key: OptionKey::Steps,
        short: "-t",
        long: "--steps",
        value: Some("steps"),
    },
    OptionSpec {
        key: OptionKey::Scale,
        short: "-c",
        long: "--scale",
        value: Some("scale"),
    },
    OptionSpec {
        key: OptionKey::Noise,
        short: "-n",
        long: "--noise",
        value: Some("noise"),
    },
    OptionSpec {
        key: OptionKey::Strength,
        short: "-N",
        long: "--strength",
        value: Some("strength"),
    },
    OptionSpec {
        key: OptionKey::HiresFix,
        short: "-H",
        long: "--hires-fix",
        value: None,
    },
    OptionSpec {
        key: OptionKey::Smea,
        short: "-S",
        long: "--smea",
        value: None,
    },
    OptionSpec {
        key: OptionKey::SmeaDyn,
        short: "-d",
        long: "--smea-dyn",
        value: None,
    },
    OptionSpec {
        key: OptionKey::Scheduler,
        short: "-C",
        long: "--scheduler",
        value: Some("scheduler"),
    },
    OptionSpec {
        key: OptionKey::Decrisper,
        short: "-D",
        long: "--decrisper",
        value: None,
    },
    OptionSpec {
        key: OptionKey::NoTranslator,
        short: "-T",
        long: "--no-translator",
        value: None,
    },
    OptionSpec {
        key: OptionKey::Iterations,
        short: "-i",
        long: "--iterations",
        value: Some("iterations"),
    },
    OptionSpec {
        key: OptionKey::Batch,
        short: "-b",
        long: "--batch",
        value: Some("batch"),
    },
];

pub(crate) fn find_option(flag: &str) -> Option<&'static OptionSpec> {
    OPTION_SPECS
        .iter()
        .find(|spec| spec.short == flag || spec.long == flag)
}

/// Usage lines for the flags a backend registers.
pub fn option_help(capabilities: &Capabilities) -> Vec<String> {
    OPTION_SPECS
        .iter()
        .filter(|spec| spec.key.is_supported(capabilities))
        .map(|spec| match spec.value {
            Some(value) => format!("{}, {} <{value}>", spec.short, spec.long),
            None => format!("{}, {}", spec.short, spec.long),
        })
        .collect()
}

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "novelai <prompt> [flags]",
    "nai <prompt> [flags]",
    "imagine <prompt> [flags]",
    "enhance <img src=\"...\"/> [flags]",
    "/channel <id>",
    "/reload",
    "/help",
    "/quit",
];
