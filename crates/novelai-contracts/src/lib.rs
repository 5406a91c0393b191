pub mod capabilities;
pub mod chat;
pub mod config;
pub mod events;
pub mod media;
pub mod messages;
pub mod prompt;
pub mod resolution;
