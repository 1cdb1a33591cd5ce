//! Errors produced while connecting, publishing to, or closing the OTLP output.
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type used across the output adapter.
pub type OutputResult<T> = Result<T, Error>;

/// Errors that can occur while running the OTLP output.
#[derive(Error, Debug)]
// Non-exhaustive to allow for future expansion without breaking changes.
#[non_exhaustive]
pub enum Error {
    /// A configured certificate or key file could not be read or parsed.
    ///
    /// Fatal to client construction; it is never retried internally.
    #[error("failed to load TLS credentials from {}: {reason}", path.display())]
    CredentialLoad {
        /// The offending file.
        path: PathBuf,
        /// Why the file was rejected.
        reason: String,
    },

    /// The signal exporter or its RPC channel could not be built.
    #[error("failed to initialize exporter: {0}")]
    ExporterInit(String),

    /// `connect` failed. The client is permanently failed and must be rebuilt.
    #[error("connect failed: {0}")]
    Connect(#[source] Box<Error>),

    /// An event could not be encoded. Recoverable through the retry set.
    #[error("event encoding failed: {0}")]
    EventEncoding(String),

    /// The caller broke the client's usage contract.
    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    /// Flushing or shutting down the provider failed.
    #[error("shutdown failed: {0}")]
    Shutdown(String),

    /// Flushing or shutting down the provider exceeded its time bound.
    #[error("shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Invalid configuration.
    #[error("{name}: {reason}")]
    InvalidConfig {
        /// The configuration name.
        name: String,
        /// The reason the configuration is invalid.
        reason: String,
    },
}

impl Error {
    pub(crate) fn invalid_config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn credential_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::CredentialLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for errors that leave the client unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::EventEncoding(_) | Error::Shutdown(_) | Error::ShutdownTimeout(_)
        )
    }
}

impl From<opentelemetry_otlp::ExporterBuildError> for Error {
    fn from(err: opentelemetry_otlp::ExporterBuildError) -> Self {
        Error::ExporterInit(err.to_string())
    }
}

impl From<opentelemetry_sdk::error::OTelSdkError> for Error {
    fn from(err: opentelemetry_sdk::error::OTelSdkError) -> Self {
        Error::Shutdown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn connect_error_keeps_cause() {
        let err = Error::Connect(Box::new(Error::credential_load("/nope.pem", "not found")));
        assert!(err.is_fatal());
        let source = std::error::Error::source(&err).expect("connect error has a source");
        assert!(source.to_string().contains("/nope.pem"));
    }

    #[test]
    fn encoding_and_shutdown_errors_are_not_fatal() {
        assert!(!Error::EventEncoding("bad".into()).is_fatal());
        assert!(!Error::Shutdown("already shut down".into()).is_fatal());
        assert!(Error::InvariantViolation("publish before connect").is_fatal());
    }
}
