//! Link service: the connection state machine
//!
//! [`LinkService`] is the single owner of a printer link. It holds the
//! current [`LinkState`] under one mutex together with the active connect
//! attempt and the connected worker, so a reader of `state()` can never
//! observe `Connected` without a live channel or `Connecting` without an
//! attempt in flight.
//!
//! Each connect starts a new session with a fresh id. Workers carry the id
//! of the session that spawned them and every callback into the core checks
//! it under the lock, so a superseded worker that finishes late is a silent
//! no-op.
//!
//! ```no_run
//! use transport::{LinkService, TcpTarget, TcpTransport};
//!
//! let service = LinkService::new(TcpTransport::default());
//! let events = service.events();
//! service.connect(TcpTarget::parse("192.168.0.50", "9100")?);
//! let event = events.recv_blocking()?;
//! println!("{:?}", event);
//! if service.state().is_connected() {
//!     service.write(b"\x1b@Hello\n".to_vec())?;
//! }
//! service.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::cancel::CancelToken;
use crate::error::{LinkError, Result};
use crate::link::{Channel, Transport};
use crate::worker::{ConnectedWorker, spawn_connect};
use bytes::Bytes;
use common::{EventReceiver, EventSender, FailureReason, LinkEvent, LinkState, create_event_channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Point-in-time view of a link, taken under the state lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// A connect attempt is registered
    pub attempt_active: bool,
    /// A connected worker owns a live channel
    pub channel_live: bool,
    /// Id of the most recently started session
    pub session_id: u64,
    /// Payloads accepted by `write` that the channel has not yet taken
    ///
    /// Always 0 unless connected.
    pub pending_writes: usize,
}

struct ConnectAttempt {
    token: Arc<CancelToken>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct Session {
    state: LinkState,
    id: u64,
    attempt: Option<ConnectAttempt>,
    connected: Option<ConnectedWorker>,
    /// Worker threads that have been cancelled but not yet joined
    retired: Vec<JoinHandle<()>>,
}

impl Session {
    fn set_state(&mut self, next: LinkState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal link transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("Link state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn retire(&mut self, handle: JoinHandle<()>) {
        self.retired.retain(|h| !h.is_finished());
        self.retired.push(handle);
    }

    /// Cancel the attempt and close the connected worker, if any
    fn teardown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            debug!("Cancelling connect attempt for session {}", self.id);
            attempt.token.cancel();
            self.retire(attempt.handle);
        }
        if let Some(worker) = self.connected.take() {
            debug!("Closing channel for session {}", self.id);
            for handle in worker.cancel() {
                self.retire(handle);
            }
        }
        self.set_state(LinkState::None);
    }
}

/// State shared between the service and its workers
pub(crate) struct Core {
    session: Mutex<Session>,
    events: EventSender,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the outcome of a connect attempt
    pub(crate) fn finish_connect(
        self: &Arc<Self>,
        session_id: u64,
        token: &CancelToken,
        result: Result<Arc<dyn Channel>>,
        recv_buffer_size: usize,
    ) {
        let mut session = self.lock();

        let current = session.id == session_id
            && session.state == LinkState::Connecting
            && !token.is_cancelled();
        if !current {
            match result {
                Ok(channel) => {
                    debug!(
                        "Session {}: handshake finished after cancellation, closing channel",
                        session_id
                    );
                    channel.close();
                }
                Err(e) => debug!("Session {}: cancelled attempt ended with {}", session_id, e),
            }
            return;
        }

        if let Some(attempt) = session.attempt.take() {
            session.retire(attempt.handle);
        }

        match result {
            Ok(channel) => {
                let name = channel.peer_name();
                match ConnectedWorker::start(
                    Arc::clone(self),
                    session_id,
                    Arc::clone(&channel),
                    recv_buffer_size,
                ) {
                    Ok(worker) => {
                        session.connected = Some(worker);
                        session.set_state(LinkState::Connected);
                        match name {
                            Some(name) => {
                                info!("Session {}: connected to {}", session_id, name);
                                self.events.post(LinkEvent::ConnectedTo(name));
                            }
                            None => {
                                info!("Session {}: connected", session_id);
                                self.events.post(LinkEvent::Connected);
                            }
                        }
                    }
                    Err(e) => {
                        error!("Session {}: failed to start I/O threads: {}", session_id, e);
                        channel.close();
                        session.set_state(LinkState::None);
                        self.events
                            .post(LinkEvent::Failure(FailureReason::ConnectFailed));
                    }
                }
            }
            Err(e) => {
                warn!("Session {}: connect failed: {}", session_id, e);
                session.set_state(LinkState::None);
                self.events.post(LinkEvent::Failure(e.reason()));
            }
        }
    }

    /// Post an inbound frame if the session is still live
    ///
    /// Returns false when the reader should exit.
    pub(crate) fn deliver(&self, session_id: u64, frame: Bytes) -> bool {
        let session = self.lock();
        if session.id != session_id || session.state != LinkState::Connected {
            return false;
        }
        self.events.post(LinkEvent::Received(frame));
        true
    }

    /// Report a lost connection once and return to `None`
    pub(crate) fn connection_lost(&self, session_id: u64) {
        let mut session = self.lock();
        if session.id != session_id || session.state != LinkState::Connected {
            return;
        }

        warn!("Session {}: connection lost", session_id);
        session.teardown();
        self.events
            .post(LinkEvent::Failure(FailureReason::ConnectionLost));
    }

    fn take_retired(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.lock().retired)
    }
}

/// Connection manager for one printer link over transport `T`
///
/// Not `Clone`: the owner decides how the service is shared (for example
/// behind an `Arc`) and dropping it stops the link.
pub struct LinkService<T: Transport> {
    transport: Arc<T>,
    core: Arc<Core>,
    events: EventReceiver,
}

impl<T: Transport> LinkService<T> {
    /// Create a service in state `None`
    pub fn new(transport: T) -> Self {
        let (tx, rx) = create_event_channel();
        Self {
            transport: Arc::new(transport),
            core: Arc::new(Core {
                session: Mutex::new(Session::default()),
                events: tx,
            }),
            events: rx,
        }
    }

    /// Receiver for this link's notifications
    ///
    /// Every clone shares one queue; each event is delivered to exactly
    /// one receiver.
    pub fn events(&self) -> EventReceiver {
        self.events.clone()
    }

    /// The transport this service connects over
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Current lifecycle state
    pub fn state(&self) -> LinkState {
        self.core.lock().state
    }

    /// State together with the worker bookkeeping behind it
    pub fn status(&self) -> LinkStatus {
        let session = self.core.lock();
        LinkStatus {
            state: session.state,
            attempt_active: session.attempt.is_some(),
            channel_live: session.connected.is_some(),
            session_id: session.id,
            pending_writes: Self::pending_in(&session),
        }
    }

    /// Start connecting to `target`
    ///
    /// Any attempt in flight is cancelled and any live channel closed before
    /// the new attempt starts. Returns once the state is `Connecting`; the
    /// outcome arrives as an event.
    pub fn connect(&self, target: T::Descriptor) {
        let mut session = self.core.lock();
        session.teardown();

        session.id += 1;
        let session_id = session.id;
        let token = Arc::new(CancelToken::new());

        info!(
            "Session {}: starting {} connect to {:?}",
            session_id,
            self.transport.name(),
            target
        );

        match spawn_connect(
            Arc::clone(&self.core),
            Arc::clone(&self.transport),
            session_id,
            target,
            Arc::clone(&token),
        ) {
            Ok(handle) => {
                session.attempt = Some(ConnectAttempt { token, handle });
                session.set_state(LinkState::Connecting);
            }
            Err(e) => {
                error!("Session {}: failed to spawn connect thread: {}", session_id, e);
                self.core
                    .events
                    .post(LinkEvent::Failure(FailureReason::ConnectFailed));
            }
        }
    }

    /// Stop whatever is in progress and return to `None`
    ///
    /// Safe to call at any time and any number of times. Worker threads
    /// are unblocked but not joined; see [`shutdown`](Self::shutdown).
    pub fn stop(&self) {
        let mut session = self.core.lock();
        if session.state != LinkState::None {
            info!("Session {}: stopping", session.id);
        }
        session.teardown();
    }

    /// Queue `data` for the connected printer
    ///
    /// Fails with [`LinkError::NotConnected`] unless the link is connected,
    /// without touching the transport. Returns without waiting for the
    /// bytes to be written.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let session = self.core.lock();
        match (session.state, session.connected.as_ref()) {
            (LinkState::Connected, Some(worker)) => {
                if data.is_empty() {
                    return Ok(());
                }
                worker.enqueue(data)
            }
            _ => Err(LinkError::NotConnected),
        }
    }

    /// Number of written payloads not yet handed to the transport
    ///
    /// Always 0 unless connected.
    pub fn pending_writes(&self) -> usize {
        Self::pending_in(&self.core.lock())
    }

    fn pending_in(session: &Session) -> usize {
        match (session.state, session.connected.as_ref()) {
            (LinkState::Connected, Some(worker)) => worker.pending(),
            _ => 0,
        }
    }

    /// Post a notification that did not come from a worker
    pub(crate) fn notify(&self, event: LinkEvent) {
        self.core.events.post(event);
    }

    /// Stop the link and wait for every worker thread it started to exit
    ///
    /// The event channel is closed afterwards: receivers still holding a
    /// clone drain what was posted and then see the channel end.
    pub fn shutdown(self) {
        self.stop();
        let handles = self.core.take_retired();
        debug!("Joining {} worker threads", handles.len());
        for handle in handles {
            if handle.join().is_err() {
                error!("Link worker thread panicked");
            }
        }
        self.core.events.close();
    }
}

impl<T: Transport> Drop for LinkService<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockBehavior, MockTarget, MockTransport};
    use common::test_utils::wait_until;
    use std::time::Duration;

    #[test]
    fn test_initial_state() {
        let service = LinkService::new(MockTransport::new());
        let status = service.status();
        assert_eq!(status.state, LinkState::None);
        assert!(!status.attempt_active);
        assert!(!status.channel_live);
    }

    #[test]
    fn test_connect_sets_connecting_before_returning() {
        let transport = MockTransport::new();
        let gate = transport.gate();
        let service = LinkService::new(transport);

        service.connect(MockTarget::new("a", MockBehavior::WaitForGate));
        let status = service.status();
        assert_eq!(status.state, LinkState::Connecting);
        assert!(status.attempt_active);

        gate.open();
        assert!(wait_until(Duration::from_secs(2), || service.state()
            == LinkState::Connected));
        service.shutdown();
    }

    #[test]
    fn test_write_when_not_connected() {
        let transport = MockTransport::new();
        let gate = transport.gate();
        let service = LinkService::new(transport);

        assert!(matches!(
            service.write(b"abc".to_vec()),
            Err(LinkError::NotConnected)
        ));

        service.connect(MockTarget::new("a", MockBehavior::WaitForGate));
        assert!(matches!(
            service.write(b"abc".to_vec()),
            Err(LinkError::NotConnected)
        ));
        assert_eq!(service.state(), LinkState::Connecting);

        service.stop();
        gate.open();
        service.shutdown();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let service = LinkService::new(MockTransport::new());
        service.stop();
        service.stop();
        assert_eq!(service.state(), LinkState::None);

        service.connect(MockTarget::new("a", MockBehavior::Succeed));
        service.stop();
        service.stop();
        assert_eq!(service.state(), LinkState::None);
        service.shutdown();
    }

    #[test]
    fn test_shutdown_closes_event_channel() {
        let service = LinkService::new(MockTransport::new());
        let events = service.events();
        service.connect(MockTarget::new("a", MockBehavior::Succeed));
        assert!(wait_until(Duration::from_secs(2), || service.state()
            == LinkState::Connected));

        service.shutdown();
        assert_eq!(events.recv_blocking().unwrap(), LinkEvent::Connected);
        assert!(events.recv_blocking().is_err());
    }

    #[test]
    fn test_session_ids_increase() {
        let service = LinkService::new(MockTransport::new());
        service.connect(MockTarget::new("a", MockBehavior::Succeed));
        let first = service.status().session_id;
        service.connect(MockTarget::new("b", MockBehavior::Succeed));
        assert!(service.status().session_id > first);
        service.shutdown();
    }
}
