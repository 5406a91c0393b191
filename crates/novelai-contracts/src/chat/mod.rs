pub mod command_parser;
pub mod command_registry;

pub use command_parser::{
    parse_chat_line, parse_invocation, ChatLine, CommandOptions, Invocation, OptionError,
};
pub use command_registry::{option_help, OptionKey, OptionSpec, CHAT_HELP_COMMANDS, OPTION_SPECS};
