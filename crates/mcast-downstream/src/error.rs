// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error and status types for the downstream node.
//!
//! Every task of a session stops for exactly one of these reasons, and the
//! coordinator decides between "retry" and "terminate" from it alone.

use thiserror::Error;

/// Result type for downstream operations
pub type Result<T> = std::result::Result<T, Error>;

/// Downstream errors (and the distinguished `Shutdown` status).
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Shutdown was requested or a queue/transport was closed underneath a
    /// blocking call. Not a failure.
    #[error("Shut down")]
    Shutdown,

    /// Host or port of the upstream server can't be used.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The upstream rejected the feed specification.
    #[error("Invalid feed: {0}")]
    InvalidFeed(String),

    /// The upstream refused the subscription.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// IPv6 isn't available on this host.
    #[error("IPv6 not supported: {0}")]
    Ipv6Unsupported(String),

    /// The upstream refused the connection.
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Connect or subscribe timed out.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// Transient network I/O failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// The RPC connection failed or was closed.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// The upstream sent something it shouldn't have.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Durable storage (session memory or product store) failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Unrecoverable local failure.
    #[error("System error: {0}")]
    System(String),
}

impl Error {
    /// Returns true for the distinguished shutdown status.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Returns true if the process must stop rather than retry a session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::System(_))
    }

    /// Returns true for configuration problems (retried, but logged as such).
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidAddress(_) | Self::InvalidFeed(_) | Self::Unauthorized(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Shutdown.is_shutdown());
        assert!(!Error::Shutdown.is_fatal());

        assert!(Error::Storage("disk".into()).is_fatal());
        assert!(Error::System("oom".into()).is_fatal());
        assert!(!Error::Rpc("broken".into()).is_fatal());
        assert!(!Error::Protocol("bad index".into()).is_fatal());

        assert!(Error::Unauthorized("feed".into()).is_config());
        assert!(Error::InvalidAddress("host".into()).is_config());
        assert!(!Error::Refused("host".into()).is_config());
    }

    #[test]
    fn test_error_display() {
        let err = Error::Rpc("connection closed".into());
        assert!(err.to_string().contains("RPC"));

        let err = Error::Protocol("unexpected".into());
        assert!(err.to_string().contains("Protocol"));
    }
}
