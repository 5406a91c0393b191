pub mod auth;
pub mod backends;
pub mod error;
pub mod gate;
pub mod input;
pub mod output;
pub mod service;
pub mod transport;

#[cfg(test)]
mod test_server;

pub use backends::{Backend, BackendPayload, GeneratedImage, GenerationParams};
pub use error::GenerationError;
pub use gate::{ConcurrencyGate, GateError, TaskBatch};
pub use output::{FigurePart, GenerationSummary, Reply};
pub use service::{help_text, GenerationService, ReplySink, Session, Translator};
pub use transport::HttpTransport;
