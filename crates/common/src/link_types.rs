//! Link state and failure reason types shared by every transport

use std::fmt;

/// Lifecycle state of a printer link
///
/// `None` is both the initial state and the state every stop, failure or
/// loss returns to. The only forward edges are `None -> Connecting` and
/// `Connecting -> Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LinkState {
    /// Nothing in progress
    #[default]
    None,
    /// A connect attempt is running
    Connecting,
    /// A live channel is open
    Connected,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == LinkState::Connected
    }

    /// Returns true if moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (LinkState::None, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connecting)
                | (LinkState::Connected, LinkState::Connecting)
                | (LinkState::Connecting, LinkState::Connected)
                | (_, LinkState::None)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::None => write!(f, "not connected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
        }
    }
}

/// Reason carried by a failure notification
///
/// Connect-time reasons end the attempt; `ConnectionLost` ends a live
/// session; `NotConnected` is caller misuse and never changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    NotConnected,
    UnknownHost,
    ConnectFailed,
    ConnectionLost,
    EndpointsNotFound,
    PermissionDenied,
}

impl FailureReason {
    /// Short message suitable for showing to a user
    pub fn message(self) -> &'static str {
        match self {
            FailureReason::NotConnected => "Printer is not connected",
            FailureReason::UnknownHost => "Unknown IP address or host name",
            FailureReason::ConnectFailed => "Unable to connect to the printer",
            FailureReason::ConnectionLost => "Printer connection was lost",
            FailureReason::EndpointsNotFound => "Printer interface has no bulk endpoints",
            FailureReason::PermissionDenied => "Permission to access the printer was denied",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
