//! USB attach supervision
//!
//! A USB printer link has a second lifecycle on top of [`LinkState`]: the
//! device has to appear, access has to be granted, and the link has to
//! follow the device when it is unplugged. [`UsbSupervisor`] tracks that as
//! an [`AttachPhase`] and drives its [`LinkService`] from hot-plug events:
//!
//! ```text
//! Idle --Attached--> PermissionPending --granted--> Claiming --Connected--> Active
//!   ^                      |  denied                  |  Failure             | Failure
//!   +----------------------+--------------------------+----------------------+
//!   ^                      Detached of the tracked device from any phase
//! ```
//!
//! The supervisor is driven by its owner, which feeds it both hot-plug
//! events and the link events read from [`LinkService::events`].
//!
//! [`LinkState`]: common::LinkState

use super::backend::UsbBackend;
use super::device::{UsbDeviceId, UsbDeviceInfo, UsbFilter, matches_any};
use super::hotplug::HotplugEvent;
use super::transport::{UsbTarget, UsbTransport};
use crate::error::Result;
use crate::service::LinkService;
use async_channel::Sender;
use common::{FailureReason, LinkEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the supervised device is in its attach lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachPhase {
    /// No device tracked
    #[default]
    Idle,
    /// Waiting for the answer to a permission request
    PermissionPending(UsbDeviceId),
    /// Connect issued, waiting for the link outcome
    Claiming(UsbDeviceId),
    /// Link connected to this device
    Active(UsbDeviceId),
}

impl AttachPhase {
    /// The tracked device, if any
    pub fn device(self) -> Option<UsbDeviceId> {
        match self {
            AttachPhase::Idle => None,
            AttachPhase::PermissionPending(id)
            | AttachPhase::Claiming(id)
            | AttachPhase::Active(id) => Some(id),
        }
    }
}

/// Grants or refuses access to a device
///
/// The answer is delivered asynchronously as [`HotplugEvent::Permission`].
pub trait PermissionBroker: Send + Sync {
    fn request(&self, device: &UsbDeviceInfo);
}

/// Answers at once by checking whether the device can be opened
///
/// On Linux access is decided by udev rules, so there is nobody to ask.
pub struct RusbPermissionBroker<B: UsbBackend> {
    backend: Arc<B>,
    sink: Sender<HotplugEvent>,
}

impl<B: UsbBackend> RusbPermissionBroker<B> {
    pub fn new(backend: Arc<B>, sink: Sender<HotplugEvent>) -> Self {
        Self { backend, sink }
    }
}

impl<B: UsbBackend> PermissionBroker for RusbPermissionBroker<B> {
    fn request(&self, device: &UsbDeviceInfo) {
        let granted = self.backend.probe_access(device.id);
        if !granted {
            warn!(
                "No access to USB device {}; check the udev rules for {:04x}",
                device.id, device.vendor_id
            );
        }
        let event = HotplugEvent::Permission {
            device: device.id,
            granted,
        };
        if self.sink.try_send(event).is_err() {
            debug!("Permission answer dropped, receiver gone");
        }
    }
}

/// Drives a USB [`LinkService`] from device attach and detach
pub struct UsbSupervisor<B: UsbBackend, P: PermissionBroker> {
    service: LinkService<UsbTransport<B>>,
    broker: P,
    filters: Vec<UsbFilter>,
    interface: u8,
    phase: AttachPhase,
    /// Identity of the tracked device, pinned when it attached
    pinned: Option<UsbFilter>,
}

impl<B: UsbBackend, P: PermissionBroker> UsbSupervisor<B, P> {
    pub fn new(
        service: LinkService<UsbTransport<B>>,
        broker: P,
        filters: Vec<UsbFilter>,
        interface: u8,
    ) -> Self {
        Self {
            service,
            broker,
            filters,
            interface,
            phase: AttachPhase::Idle,
            pinned: None,
        }
    }

    pub fn service(&self) -> &LinkService<UsbTransport<B>> {
        &self.service
    }

    pub fn phase(&self) -> AttachPhase {
        self.phase
    }

    fn set_phase(&mut self, next: AttachPhase) {
        if self.phase != next {
            debug!("USB attach phase {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
        if next == AttachPhase::Idle {
            self.pinned = None;
        }
    }

    /// Offer every matching device that is already plugged in
    pub fn rescan(&mut self) -> Result<()> {
        let devices = self.service.transport().backend().devices()?;
        for info in devices {
            if matches_any(&self.filters, info.vendor_id, info.product_id) {
                self.handle_hotplug(HotplugEvent::Attached(info));
            }
        }
        Ok(())
    }

    pub fn handle_hotplug(&mut self, event: HotplugEvent) {
        match event {
            HotplugEvent::Attached(info) => self.on_attached(info),
            HotplugEvent::Detached(id) => self.on_detached(id),
            HotplugEvent::Permission { device, granted } => self.on_permission(device, granted),
        }
    }

    fn on_attached(&mut self, info: UsbDeviceInfo) {
        if !matches_any(&self.filters, info.vendor_id, info.product_id) {
            debug!("Ignoring attach of {}: no filter matches", info.label());
            return;
        }
        if self.phase != AttachPhase::Idle {
            debug!(
                "Ignoring attach of {} while tracking {:?}",
                info.label(),
                self.phase
            );
            return;
        }

        info!("Printer attached: {} at {}", info.label(), info.id);
        self.pinned = Some(UsbFilter {
            vendor_id: info.vendor_id,
            product_id: Some(info.product_id),
        });
        self.set_phase(AttachPhase::PermissionPending(info.id));
        self.broker.request(&info);
    }

    fn on_permission(&mut self, device: UsbDeviceId, granted: bool) {
        if self.phase != AttachPhase::PermissionPending(device) {
            debug!("Ignoring permission answer for {} in {:?}", device, self.phase);
            return;
        }

        if !granted {
            warn!("Permission denied for USB device {}", device);
            self.set_phase(AttachPhase::Idle);
            self.service
                .notify(LinkEvent::Failure(FailureReason::PermissionDenied));
            return;
        }

        let filter = self.pinned.unwrap_or_default();
        let target = UsbTarget::new(device, filter).with_interface(self.interface);
        self.service.connect(target);
        self.set_phase(AttachPhase::Claiming(device));
    }

    fn on_detached(&mut self, device: UsbDeviceId) {
        if self.phase.device() != Some(device) {
            return;
        }
        info!("Printer {} detached", device);
        if matches!(
            self.phase,
            AttachPhase::Claiming(_) | AttachPhase::Active(_)
        ) {
            self.service.stop();
        }
        self.set_phase(AttachPhase::Idle);
    }

    /// Follow the link outcome of a claim
    pub fn handle_link_event(&mut self, event: &LinkEvent) {
        match (self.phase, event) {
            (AttachPhase::Claiming(id), LinkEvent::Connected | LinkEvent::ConnectedTo(_))
                if self.service.state().is_connected() =>
            {
                self.set_phase(AttachPhase::Active(id));
            }
            (AttachPhase::Claiming(_) | AttachPhase::Active(_), LinkEvent::Failure(reason))
                if !self.service.state().is_connected() =>
            {
                debug!("USB link ended ({}), waiting for the next attach", reason);
                self.set_phase(AttachPhase::Idle);
            }
            _ => {}
        }
    }

    /// Stop the link and forget the tracked device
    pub fn stop(&mut self) {
        self.service.stop();
        self.set_phase(AttachPhase::Idle);
    }

    /// Stop the link and join its worker threads
    pub fn shutdown(self) {
        self.service.shutdown();
    }
}
