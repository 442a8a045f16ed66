pub mod normalize;
pub mod sandbox;
pub mod source;

pub use normalize::{normalize, Normalized, NormalizedCandidate};
pub use sandbox::{SandboxExecutor, SandboxResult};
pub use source::SourceUnit;
