//! Unified error type.

/// The error type returned by meadowlark's fallible infrastructure operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, and unexpected handler failures as
/// [`Fault`](crate::Fault)s. This type surfaces infrastructure failures:
/// binding to a port, loading configuration, supervising workers.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Binding, accepting, or any other socket-level failure.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The listen address could not be parsed as `host:port`.
    #[error("invalid socket address `{0}`")]
    InvalidAddr(String),

    /// Configuration could not be loaded or failed validation.
    #[error("config: {0}")]
    Config(String),

    /// A cluster worker could not be spawned or talked to.
    #[error("worker: {0}")]
    Worker(String),

    /// The global log subscriber could not be installed.
    #[error("telemetry: {0}")]
    Telemetry(String),
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
