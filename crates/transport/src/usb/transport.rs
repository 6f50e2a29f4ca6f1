//! USB printer transport
//!
//! The handshake has no byte exchange: it checks that the device at the
//! requested bus location is still the vendor's printer, picks the bulk
//! endpoint pair of the configured interface and claims it.

use super::backend::UsbBackend;
use super::device::{UsbDeviceId, UsbFilter, select_bulk_endpoints};
use crate::cancel::CancelToken;
use crate::error::{LinkError, Result};
use crate::link::{Channel, Transport};
use std::sync::Arc;
use tracing::debug;

/// Default receive buffer size (bytes)
pub const DEFAULT_RECV_BUFFER: usize = 128;

/// Printer interface on a permission-granted device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbTarget {
    pub device: UsbDeviceId,
    pub interface: u8,
    /// The device must still match this filter when the claim happens
    pub filter: UsbFilter,
}

impl UsbTarget {
    pub fn new(device: UsbDeviceId, filter: UsbFilter) -> Self {
        Self {
            device,
            interface: 0,
            filter,
        }
    }

    pub fn with_interface(mut self, interface: u8) -> Self {
        self.interface = interface;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbSettings {
    pub recv_buffer: usize,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            recv_buffer: DEFAULT_RECV_BUFFER,
        }
    }
}

pub struct UsbTransport<B: UsbBackend> {
    backend: Arc<B>,
    settings: UsbSettings,
}

impl<B: UsbBackend> UsbTransport<B> {
    pub fn new(backend: Arc<B>, settings: UsbSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }
}

impl<B: UsbBackend> Transport for UsbTransport<B> {
    type Descriptor = UsbTarget;

    fn name(&self) -> &'static str {
        "usb"
    }

    fn open(&self, target: &UsbTarget, cancel: &CancelToken) -> Result<Arc<dyn Channel>> {
        let info = self.backend.device(target.device)?.ok_or_else(|| {
            LinkError::ConnectFailed(format!("USB device {} is not present", target.device))
        })?;
        if !target.filter.matches(info.vendor_id, info.product_id) {
            return Err(LinkError::ConnectFailed(format!(
                "USB device {} ({:04x}:{:04x}) does not match {}",
                target.device, info.vendor_id, info.product_id, target.filter
            )));
        }

        let endpoints = self.backend.endpoints(target.device, target.interface)?;
        let selected = select_bulk_endpoints(target.interface, &endpoints)?;
        debug!(
            "USB {} interface {}: bulk in {:#04x}, bulk out {:#04x}",
            target.device, target.interface, selected.bulk_in, selected.bulk_out
        );

        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        self.backend.claim(target.device, selected)
    }

    fn recv_buffer_size(&self) -> usize {
        self.settings.recv_buffer
    }
}
