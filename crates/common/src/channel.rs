//! Ordered event channel between link workers and the owning context
//!
//! Workers run on plain OS threads and post with [`EventSender::post`],
//! which never blocks. The owning context pulls events either from async
//! code ([`EventReceiver::recv`]) or from a blocking thread
//! ([`EventReceiver::recv_blocking`]). A single unbounded queue per link
//! keeps events in the order they were generated.

use crate::link_types::FailureReason;
use async_channel::{Receiver, Sender, TryRecvError, unbounded};
use bytes::Bytes;

/// Notification from a link to its owning context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Connected to a peer that reported a human-readable name
    ConnectedTo(String),

    /// Connected to a peer with no name to report
    Connected,

    /// A connect attempt failed, or a live connection was lost
    Failure(FailureReason),

    /// One frame of inbound bytes, copied out of the receive buffer
    Received(Bytes),
}

impl LinkEvent {
    /// Returns true for either flavour of connected notification
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkEvent::Connected | LinkEvent::ConnectedTo(_))
    }
}

/// Sending half, held by the link and cloned into its workers
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<LinkEvent>,
}

impl EventSender {
    /// Post an event without blocking
    ///
    /// Returns false once every receiver has been dropped.
    pub fn post(&self, event: LinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::trace!("Dropping link event, owner has gone away: {:?}", e.into_inner());
                false
            }
        }
    }

    /// Close the channel; pending events can still be received
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Receiving half, held by the owning context
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Receiver<LinkEvent>,
}

impl EventReceiver {
    /// Receive the next event from async code
    pub async fn recv(&self) -> crate::Result<LinkEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next event from a blocking thread
    pub fn recv_blocking(&self) -> crate::Result<LinkEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<LinkEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Drain every event that is already queued
    pub fn drain(&self) -> Vec<LinkEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Number of events waiting to be received
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if no events are waiting
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create the event channel for one link
///
/// Returns (EventSender for the link, EventReceiver for the owner)
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = unbounded();
    (EventSender { tx }, EventReceiver { rx })
}
