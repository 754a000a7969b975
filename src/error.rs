// mitm_injector::error
//
// Error kinds raised while mutating a response.  None of these escape the
// pipeline: the orchestrator decides per stage whether an error is recovered
// (logged, remaining steps still run) or fatal (original response delivered).

use thiserror::Error;

/// Result type for mutation operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The body could not be turned into text (unsupported content encoding,
    /// corrupt compressed stream, malformed charset data).
    #[error("body decode failed: {0}")]
    DecodeFailure(String),

    /// A CSP directive did not look like `name token*`.  The segment is kept
    /// verbatim and rewriting continues.
    #[error("malformed CSP directive: {0}")]
    CspParseAnomaly(String),

    /// Selector or tree manipulation problem inside the injector.
    #[error("content injection failed: {0}")]
    InjectionFailure(String),

    /// The mutated document could not be written back out.
    #[error("serialization failed: {0}")]
    SerializeFailure(String),

    /// A stage panicked.  Caught at the stage or pipeline boundary.
    #[error("panic during mutation: {0}")]
    Panic(String),

    /// Invalid configuration input.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Config(value.to_string())
    }
}
