//! Crate-wide error type.

use std::time::Duration;

/// Errors surfaced across the store/sender/identity/register/command-channel
/// components. Transient network failures are retried by their owner and
/// never reach a plugin.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Network timeout, connection reset, DNS failure, or similar. Callers
    /// retry with exponential backoff.
    #[error("transient network error: {0}")]
    Transient(String),

    /// Backend responded 429. `retry_after` is `Some` when the response
    /// carried a `Retry-After` header.
    #[error("rate limited, retry_after={retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// Backend asked for a full local reset (`resetAll` in the deltas
    /// response, or an agent-ID change).
    #[error("reset requested: {0}")]
    ResetRequested(&'static str),

    /// Command arguments failed to deserialize into the handler's expected
    /// shape.
    #[error("invalid command arguments: {0}")]
    InvalidArgs(String),

    /// No handler is registered for the command name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// The requested operation is not supported on this OS (the
    /// `stop_integration` handler on Windows).
    #[error("unsupported on this operating system: {0}")]
    OsNotSupported(&'static str),

    /// A sender observed an empty agent entity ID where a non-empty one was
    /// required.
    #[error("agent entity id is not yet known")]
    EmptyEntityId,

    /// Identifier lookup produced no non-empty source.
    #[error("no identifier source produced a non-empty value")]
    UndefinedLookupType,

    /// Startup could not proceed: reachability probe exhausted its retry
    /// budget, or identity could not be established.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// The configuration failed validation at load time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A `SetFeatureFlag` call was rejected because the flag is config-owned
    /// or already holds the requested value.
    #[error("feature flag already set: {0}")]
    AlreadyExists(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    pub fn transient(e: impl std::fmt::Display) -> Self {
        AgentError::Transient(e.to_string())
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
