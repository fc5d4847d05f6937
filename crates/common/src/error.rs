//! Common error types shared across crates.

use thiserror::Error;

/// Top-level valve error type.
///
/// All variants except [`ValveError::InvalidCommand`] are setup errors:
/// they are raised while the service is being configured or started and
/// abort startup. Per-connection I/O failures never surface here — they are
/// logged and absorbed at the connection boundary.
#[derive(Debug, Error)]
pub enum ValveError {
    /// A listener or server address string could not be parsed or resolved.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// A configured filter identifier has no registered constructor.
    #[error("unknown filter: {0}")]
    UnknownFilter(String),

    /// The configuration is structurally invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A TLS security context could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// A control connection sent a line that is not a known command.
    #[error("invalid control command: {0:?}")]
    InvalidCommand(String),
}

impl ValveError {
    /// Returns true for errors that abort service startup.
    pub fn is_setup(&self) -> bool {
        !matches!(self, ValveError::InvalidCommand(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_classification() {
        assert!(ValveError::BadAddress("x".into()).is_setup());
        assert!(ValveError::UnknownFilter("x".into()).is_setup());
        assert!(ValveError::Config("x".into()).is_setup());
        assert!(ValveError::Tls("x".into()).is_setup());
        assert!(!ValveError::InvalidCommand("x".into()).is_setup());
    }

    #[test]
    fn display_includes_message() {
        let e = ValveError::BadAddress("localhost:http".into());
        assert!(e.to_string().contains("localhost:http"));
    }
}
