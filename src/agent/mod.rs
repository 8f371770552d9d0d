//! Agent runtime: provider stream normalization, transcript
//! reconciliation, and the orchestrator that owns agent subprocesses.

pub mod handler;
pub mod message;
pub mod orchestrator;
pub mod provider;

pub use handler::{MessageHandler, ThreadRunState};
pub use message::CliMessage;
pub use orchestrator::{AgentOrchestrator, StartAgentParams};
