//! Test doubles for the link service and the USB stack
//!
//! [`MockTransport`] opens [`MockChannel`]s whose inbound data, failures and
//! recorded writes are controlled by the test. [`MockUsbBackend`] stands in
//! for libusb so the USB transport and supervisor run without hardware.
//!
//! # Example
//!
//! ```
//! use transport::LinkService;
//! use transport::test_utils::{MockBehavior, MockTarget, MockTransport};
//!
//! let service = LinkService::new(MockTransport::new());
//! service.connect(MockTarget::new("printer", MockBehavior::Succeed));
//! service.shutdown();
//! ```

use crate::cancel::CancelToken;
use crate::error::{LinkError, Result};
use crate::link::{Channel, Transport};
use crate::usb::backend::UsbBackend;
use crate::usb::device::{
    BulkEndpoints, Direction, EndpointInfo, UsbDeviceId, UsbDeviceInfo, WOOSIM_VENDOR_ID,
};
use crate::usb::supervisor::PermissionBroker;
use common::FailureReason;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latch that holds `WaitForGate` handshakes until opened
#[derive(Clone, Default)]
pub struct Gate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cv) = &*self.inner;
        *lock(open) = true;
        cv.notify_all();
    }

    /// Block until opened; returns false if `cancel` fired first
    fn wait(&self, cancel: &CancelToken) -> bool {
        let (open, cv) = &*self.inner;
        let mut guard = lock(open);
        while !*guard {
            if cancel.is_cancelled() {
                return false;
            }
            guard = cv
                .wait_timeout(guard, Duration::from_millis(5))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// What a mock handshake does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Open a channel with no peer name
    Succeed,
    /// Open a channel that reports this peer name
    SucceedAs(String),
    /// Wait for the transport's gate, then succeed
    WaitForGate,
    /// Open a channel on which every `send` fails
    RejectWrites,
    /// Fail with an error carrying this reason
    Fail(FailureReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTarget {
    pub name: String,
    pub behavior: MockBehavior,
}

impl MockTarget {
    pub fn new(name: impl Into<String>, behavior: MockBehavior) -> Self {
        Self {
            name: name.into(),
            behavior,
        }
    }
}

fn failure(reason: FailureReason, name: &str) -> LinkError {
    match reason {
        FailureReason::NotConnected => LinkError::NotConnected,
        FailureReason::UnknownHost => LinkError::UnknownHost(name.to_string()),
        FailureReason::ConnectionLost => LinkError::ConnectionLost,
        FailureReason::EndpointsNotFound => LinkError::EndpointsNotFound { interface: 0 },
        FailureReason::PermissionDenied => LinkError::PermissionDenied(name.to_string()),
        FailureReason::ConnectFailed => LinkError::ConnectFailed(name.to_string()),
    }
}

/// In-memory transport
#[derive(Default)]
pub struct MockTransport {
    gate: Gate,
    opens: AtomicUsize,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle that releases `WaitForGate` handshakes
    pub fn gate(&self) -> Gate {
        self.gate.clone()
    }

    /// Number of handshakes started
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every channel opened so far, oldest first
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.channels).clone()
    }

    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        lock(&self.channels).last().cloned()
    }

    /// Channels opened and not yet closed
    pub fn live_channels(&self) -> usize {
        lock(&self.channels).iter().filter(|c| !c.is_closed()).count()
    }
}

impl Transport for MockTransport {
    type Descriptor = MockTarget;

    fn name(&self) -> &'static str {
        "mock"
    }

    fn open(&self, target: &MockTarget, cancel: &CancelToken) -> Result<Arc<dyn Channel>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let peer = match &target.behavior {
            MockBehavior::Succeed => None,
            MockBehavior::SucceedAs(name) => Some(name.clone()),
            MockBehavior::WaitForGate => {
                if !self.gate.wait(cancel) {
                    return Err(LinkError::Cancelled);
                }
                None
            }
            MockBehavior::RejectWrites => None,
            MockBehavior::Fail(reason) => return Err(failure(*reason, &target.name)),
        };

        let channel = Arc::new(MockChannel::new(peer));
        if target.behavior == MockBehavior::RejectWrites {
            channel.fail_send();
        }
        lock(&self.channels).push(Arc::clone(&channel));
        Ok(channel)
    }

    fn recv_buffer_size(&self) -> usize {
        64
    }
}

#[derive(Default)]
struct ChannelState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<Vec<u8>>,
    closed: bool,
    close_calls: usize,
    fail_recv: bool,
    fail_send: bool,
}

/// Scriptable channel that records everything written to it
pub struct MockChannel {
    state: Mutex<ChannelState>,
    cv: Condvar,
    peer: Option<String>,
}

impl MockChannel {
    pub fn new(peer: Option<String>) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            cv: Condvar::new(),
            peer,
        }
    }

    /// Queue bytes for the next `recv`
    pub fn push_inbound(&self, data: &[u8]) {
        lock(&self.state).inbound.push_back(data.to_vec());
        self.cv.notify_all();
    }

    /// Make the pending or next `recv` fail
    pub fn fail_recv(&self) {
        lock(&self.state).fail_recv = true;
        self.cv.notify_all();
    }

    /// Make every following `send` fail
    pub fn fail_send(&self) {
        lock(&self.state).fail_send = true;
    }

    /// Payloads written, one entry per `send`
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.state).written.clone()
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.state).written.concat()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }
}

impl Channel for MockChannel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        loop {
            if state.closed {
                return Ok(0);
            }
            if state.fail_recv {
                state.fail_recv = false;
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "injected"));
            }
            if let Some(mut frame) = state.inbound.pop_front() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                if n < frame.len() {
                    state.inbound.push_front(frame.split_off(n));
                }
                return Ok(n);
            }
            state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        if state.fail_send {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.close_calls += 1;
        self.cv.notify_all();
    }

    fn peer_name(&self) -> Option<String> {
        self.peer.clone()
    }
}

#[derive(Default)]
struct UsbState {
    devices: Vec<UsbDeviceInfo>,
    endpoints: HashMap<UsbDeviceId, Vec<EndpointInfo>>,
    denied: HashSet<UsbDeviceId>,
    claims: Vec<(UsbDeviceId, BulkEndpoints)>,
    channels: Vec<Arc<MockChannel>>,
}

/// In-memory USB bus
#[derive(Default)]
pub struct MockUsbBackend {
    state: Mutex<UsbState>,
}

impl MockUsbBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor of a Woosim printer at `bus`:`address`
    pub fn printer_info(bus: u8, address: u8) -> UsbDeviceInfo {
        UsbDeviceInfo {
            id: UsbDeviceId::new(bus, address),
            vendor_id: WOOSIM_VENDOR_ID,
            product_id: 0x0010,
            manufacturer: Some("Woosim".to_string()),
            product: Some("WSP-i350".to_string()),
        }
    }

    /// Plug in a printer with bulk IN 0x81 and bulk OUT 0x02 on interface 0
    pub fn add_printer(&self, bus: u8, address: u8) -> UsbDeviceId {
        self.add_device(
            Self::printer_info(bus, address),
            vec![
                EndpointInfo::bulk(0x81, Direction::In),
                EndpointInfo::bulk(0x02, Direction::Out),
            ],
        )
    }

    /// Plug in a device whose interface 0 has `endpoints`
    pub fn add_device(&self, info: UsbDeviceInfo, endpoints: Vec<EndpointInfo>) -> UsbDeviceId {
        let id = info.id;
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.id != id);
        state.devices.push(info);
        state.endpoints.insert(id, endpoints);
        id
    }

    /// Unplug a device; its open channels see end of stream
    pub fn remove_device(&self, id: UsbDeviceId) {
        let mut state = lock(&self.state);
        state.devices.retain(|d| d.id != id);
        state.endpoints.remove(&id);
        let claimed: Vec<usize> = state
            .claims
            .iter()
            .enumerate()
            .filter(|(_, (dev, _))| *dev == id)
            .map(|(i, _)| i)
            .collect();
        for i in claimed {
            if let Some(channel) = state.channels.get(i) {
                channel.close();
            }
        }
    }

    /// Refuse to open `id`
    pub fn deny(&self, id: UsbDeviceId) {
        lock(&self.state).denied.insert(id);
    }

    pub fn claims(&self) -> Vec<(UsbDeviceId, BulkEndpoints)> {
        lock(&self.state).claims.clone()
    }

    /// Channels handed out by `claim`, oldest first
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        lock(&self.state).channels.clone()
    }
}

impl UsbBackend for MockUsbBackend {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        Ok(lock(&self.state).devices.clone())
    }

    fn endpoints(&self, id: UsbDeviceId, interface: u8) -> Result<Vec<EndpointInfo>> {
        let state = lock(&self.state);
        match state.endpoints.get(&id) {
            Some(endpoints) if interface == 0 => Ok(endpoints.clone()),
            _ => Err(LinkError::EndpointsNotFound { interface }),
        }
    }

    fn claim(&self, id: UsbDeviceId, endpoints: BulkEndpoints) -> Result<Arc<dyn Channel>> {
        let mut state = lock(&self.state);
        if state.denied.contains(&id) {
            return Err(LinkError::PermissionDenied(format!("USB device {}", id)));
        }
        if !state.devices.iter().any(|d| d.id == id) {
            return Err(LinkError::ConnectFailed(format!("USB device {} is not present", id)));
        }
        // The interface stays claimed until the previous pipe is closed
        let busy = state
            .claims
            .iter()
            .zip(&state.channels)
            .any(|((dev, _), channel)| *dev == id && !channel.is_closed());
        if busy {
            return Err(LinkError::Usb(rusb::Error::Busy));
        }
        let channel = Arc::new(MockChannel::new(None));
        state.claims.push((id, endpoints));
        state.channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    fn probe_access(&self, id: UsbDeviceId) -> bool {
        let state = lock(&self.state);
        state.devices.iter().any(|d| d.id == id) && !state.denied.contains(&id)
    }
}

/// Broker that records requests; tests answer them by hand
#[derive(Default)]
pub struct MockPermissionBroker {
    requests: Mutex<Vec<UsbDeviceId>>,
}

impl MockPermissionBroker {
    pub fn requests(&self) -> Vec<UsbDeviceId> {
        lock(&self.requests).clone()
    }
}

impl PermissionBroker for MockPermissionBroker {
    fn request(&self, device: &UsbDeviceInfo) {
        lock(&self.requests).push(device.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_channel_splits_large_frames() {
        let channel = MockChannel::new(None);
        channel.push_inbound(b"abcdef");

        let mut buf = [0u8; 4];
        assert_eq!(channel.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(channel.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn test_mock_channel_close() {
        let channel = MockChannel::new(Some("peer".into()));
        channel.send(b"x").unwrap();
        channel.close();

        let mut buf = [0u8; 4];
        assert_eq!(channel.recv(&mut buf).unwrap(), 0);
        assert!(channel.send(b"y").is_err());
        assert_eq!(channel.written(), vec![b"x".to_vec()]);
        assert_eq!(channel.peer_name().as_deref(), Some("peer"));
    }

    #[test]
    fn test_mock_transport_failure() {
        let transport = MockTransport::new();
        let result = transport.open(
            &MockTarget::new("x", MockBehavior::Fail(FailureReason::UnknownHost)),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(LinkError::UnknownHost(_))));
        assert_eq!(transport.open_count(), 1);
        assert!(transport.channels().is_empty());
    }

    #[test]
    fn test_usb_claim_busy_until_closed() {
        let backend = MockUsbBackend::new();
        let id = backend.add_printer(1, 4);
        let endpoints = BulkEndpoints {
            interface: 0,
            bulk_in: 0x81,
            bulk_out: 0x02,
        };

        let first = backend.claim(id, endpoints).unwrap();
        assert!(matches!(
            backend.claim(id, endpoints),
            Err(LinkError::Usb(rusb::Error::Busy))
        ));
        first.close();
        assert!(backend.claim(id, endpoints).is_ok());
        assert_eq!(backend.claims().len(), 2);
    }

    #[test]
    fn test_gate_releases_on_cancel() {
        let transport = MockTransport::new();
        let token = CancelToken::new();
        token.cancel();
        let result = transport.open(
            &MockTarget::new("x", MockBehavior::WaitForGate),
            &token,
        );
        assert!(matches!(result, Err(LinkError::Cancelled)));
    }
}
