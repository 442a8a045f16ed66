//! Multi-backend test synthesis: ask several generative backends for a
//! pytest suite, run each suite in its own throwaway directory and compare
//! the outcomes.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod testgen;

pub use config::Config;
pub use pipeline::{run_test_synthesis, run_with_slots};
pub use report::{Classification, ComparisonReport, Winner};
