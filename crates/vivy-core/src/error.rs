use thiserror::Error;

use crate::ids::{ServerId, TerminalId};

/// Errors reported by the remote connection and multiplexer collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("not connected")]
    NotConnected,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("could not open channel: {0}")]
    ChannelOpenFailed(String),
    #[error("shell request failed: {0}")]
    ShellRequestFailed(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("host key verification failed: {0}")]
    HostKeyVerificationFailed(String),
    #[error("remote prerequisite missing: {0}")]
    PrerequisiteMissing(String),
    #[error("authentication portal not accepted: {0}")]
    AuthPortalNotAccepted(String),
    #[error("tunnel configuration error: {0}")]
    TunnelConfiguration(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("cancelled")]
    Cancelled,
}

/// How a connect loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reset the connection and try again.
    Transient,
    /// Retry; reset the connection only if no other terminal depends on it.
    Channel,
    /// Stop retrying and surface to the user.
    Permanent,
}

impl RemoteError {
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::NotConnected
            | Self::ConnectionFailed(_)
            | Self::Socket(_)
            | Self::Timeout(_)
            | Self::Io(_) => Recovery::Transient,
            Self::ChannelOpenFailed(_) | Self::ShellRequestFailed(_) => Recovery::Channel,
            Self::AuthenticationFailed(_)
            | Self::HostKeyVerificationFailed(_)
            | Self::PrerequisiteMissing(_)
            | Self::AuthPortalNotAccepted(_)
            | Self::TunnelConfiguration(_)
            | Self::Unsupported(_)
            | Self::Cancelled => Recovery::Permanent,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.recovery() == Recovery::Permanent
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => RemoteError::Timeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => RemoteError::Socket(err.to_string()),
            _ => RemoteError::Io(err.to_string()),
        }
    }
}

/// Errors returned by the session service to its callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown terminal {0}")]
    UnknownTerminal(TerminalId),
    #[error("unknown server {0}")]
    UnknownServer(ServerId),
    #[error("session service has stopped")]
    Stopped,
    #[error("storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_classes() {
        assert_eq!(RemoteError::NotConnected.recovery(), Recovery::Transient);
        assert_eq!(
            RemoteError::Timeout("30s".into()).recovery(),
            Recovery::Transient
        );
        assert_eq!(
            RemoteError::ChannelOpenFailed("prohibited".into()).recovery(),
            Recovery::Channel
        );
        assert_eq!(
            RemoteError::AuthenticationFailed("denied".into()).recovery(),
            Recovery::Permanent
        );
        assert!(RemoteError::TunnelConfiguration("jump host".into()).is_permanent());
        assert!(RemoteError::Cancelled.is_permanent());
    }

    #[test]
    fn test_io_error_mapping() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(RemoteError::from(refused), RemoteError::Socket(_)));

        let other = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert!(matches!(RemoteError::from(other), RemoteError::Io(_)));
    }

    #[test]
    fn test_display_includes_detail() {
        let err = RemoteError::HostKeyVerificationFailed("example.com".into());
        assert_eq!(err.to_string(), "host key verification failed: example.com");
    }
}
