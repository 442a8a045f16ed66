use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of a single generative backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("missing configuration: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Why a generation attempt produced no text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("timed out after {}s", .0.as_secs_f32())]
    TimedOut(Duration),

    #[error("worker lost: {0}")]
    WorkerLost(String),
}

/// Infrastructure failure of the sandbox itself. A failing test run is
/// not one of these.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot create ephemeral directory: {0}")]
    CreateDir(#[source] io::Error),

    #[error("cannot write {path}: {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("runner command is empty")]
    EmptyCommand,

    #[error("cannot spawn `{program}` in {workdir}: {source}")]
    Spawn {
        program: String,
        workdir: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("waiting on runner failed: {0}")]
    Wait(#[source] io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("no backends configured")]
    NoBackends,

    #[error("duplicate backend name `{0}`")]
    DuplicateBackend(String),

    #[error("sandbox runner command is empty")]
    EmptyRunner,

    #[error("sandbox timeout must be greater than zero")]
    ZeroSandboxTimeout,
}
