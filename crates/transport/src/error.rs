//! Link error types

use common::FailureReason;
use thiserror::Error;

/// Errors produced by link operations and transport handshakes
#[derive(Debug, Error)]
pub enum LinkError {
    /// `write` was called while the link was not connected
    #[error("Not connected")]
    NotConnected,

    /// Host name or address could not be resolved
    #[error("Unknown host: {0}")]
    UnknownHost(String),

    /// Transport handshake failed
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A live connection ended or errored
    #[error("Connection lost")]
    ConnectionLost,

    /// USB interface lacks a bulk-IN or bulk-OUT endpoint
    #[error("Bulk endpoints not found on interface {interface}")]
    EndpointsNotFound { interface: u8 },

    /// OS refused access to the device
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Descriptor could not be parsed
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The attempt was superseded or stopped
    #[error("Cancelled")]
    Cancelled,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Failure reason reported to the owning context for this error
    pub fn reason(&self) -> FailureReason {
        match self {
            LinkError::NotConnected => FailureReason::NotConnected,
            LinkError::UnknownHost(_) => FailureReason::UnknownHost,
            LinkError::ConnectionLost => FailureReason::ConnectionLost,
            LinkError::EndpointsNotFound { .. } => FailureReason::EndpointsNotFound,
            LinkError::PermissionDenied(_) => FailureReason::PermissionDenied,
            LinkError::Usb(rusb::Error::Access) => FailureReason::PermissionDenied,
            LinkError::ConnectFailed(_)
            | LinkError::InvalidTarget(_)
            | LinkError::Cancelled
            | LinkError::Usb(_)
            | LinkError::Io(_) => FailureReason::ConnectFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_mapping() {
        assert_eq!(LinkError::NotConnected.reason(), FailureReason::NotConnected);
        assert_eq!(
            LinkError::UnknownHost("printer.invalid".into()).reason(),
            FailureReason::UnknownHost
        );
        assert_eq!(
            LinkError::EndpointsNotFound { interface: 0 }.reason(),
            FailureReason::EndpointsNotFound
        );
        assert_eq!(
            LinkError::Usb(rusb::Error::Access).reason(),
            FailureReason::PermissionDenied
        );
        assert_eq!(
            LinkError::Usb(rusb::Error::Pipe).reason(),
            FailureReason::ConnectFailed
        );
        assert_eq!(
            LinkError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)).reason(),
            FailureReason::ConnectFailed
        );
    }

    #[test]
    fn test_display() {
        let err = LinkError::EndpointsNotFound { interface: 2 };
        assert_eq!(err.to_string(), "Bulk endpoints not found on interface 2");
    }
}
