pub mod backend;
pub mod client;
pub mod command;
pub mod orchestrator;
pub mod prompt;

pub use backend::{build_roster, LlmBackend, Slot, TestGenerator};
pub use orchestrator::{run_generation, GenerationAttempt};
