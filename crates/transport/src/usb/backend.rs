//! USB backend abstraction and the libusb implementation
//!
//! [`UsbBackend`] is the seam between the USB transport and the host's USB
//! stack. [`RusbBackend`] implements it with `rusb`; tests substitute a mock.
//!
//! A claimed interface is owned by a [`RusbPipe`]. Closing the pipe
//! releases the interface and hands it back to the kernel driver that was
//! detached to claim it, so the device can be claimed again as soon as
//! `close` returns. Dropping an unclosed pipe does the same.

use super::device::{
    BulkEndpoints, Direction, EndpointInfo, TransferKind, UsbDeviceId, UsbDeviceInfo,
};
use crate::error::{LinkError, Result};
use crate::link::Channel;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Largest payload handed to one bulk OUT transfer (16 KiB)
pub const MAX_BULK_CHUNK: usize = 16 * 1024;

/// How long a bulk IN read waits before re-checking the closed flag
const READ_POLL: Duration = Duration::from_millis(100);

/// How long one bulk OUT transfer waits before it is retried
///
/// A printer that is out of paper stops accepting data; the write is
/// retried until the printer resumes or the pipe is closed.
const WRITE_POLL: Duration = Duration::from_millis(500);

/// Access to the host USB stack
pub trait UsbBackend: Send + Sync + 'static {
    /// Enumerate attached devices, including string descriptors when readable
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>>;

    /// Look up one device by bus location
    fn device(&self, id: UsbDeviceId) -> Result<Option<UsbDeviceInfo>> {
        Ok(self.devices()?.into_iter().find(|d| d.id == id))
    }

    /// Endpoints of `interface` in the active configuration
    fn endpoints(&self, id: UsbDeviceId, interface: u8) -> Result<Vec<EndpointInfo>>;

    /// Open the device and claim the interface that owns `endpoints`
    fn claim(&self, id: UsbDeviceId, endpoints: BulkEndpoints) -> Result<Arc<dyn Channel>>;

    /// Returns true if the current process may open the device
    fn probe_access(&self, id: UsbDeviceId) -> bool;
}

/// libusb-backed [`UsbBackend`]
#[derive(Clone)]
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn find(&self, id: UsbDeviceId) -> Result<Device<Context>> {
        self.context
            .devices()?
            .iter()
            .find(|d| d.bus_number() == id.bus && d.address() == id.address)
            .ok_or_else(|| LinkError::ConnectFailed(format!("USB device {} is not present", id)))
    }
}

/// Build a device summary, optionally opening the device to read strings
pub(crate) fn describe<T: UsbContext>(
    device: &Device<T>,
    with_strings: bool,
) -> rusb::Result<UsbDeviceInfo> {
    let descriptor = device.device_descriptor()?;
    let mut info = UsbDeviceInfo {
        id: UsbDeviceId::new(device.bus_number(), device.address()),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        manufacturer: None,
        product: None,
    };

    if with_strings && let Ok(handle) = device.open() {
        info.manufacturer = descriptor
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
        info.product = descriptor
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());
    }
    Ok(info)
}

/// Root hubs (Linux Foundation, hub class) are never printers
fn is_root_hub<T: UsbContext>(device: &Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|d| d.vendor_id() == 0x1d6b && d.class_code() == 9)
        .unwrap_or(false)
}

impl UsbBackend for RusbBackend {
    fn devices(&self) -> Result<Vec<UsbDeviceInfo>> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            if is_root_hub(&device) {
                continue;
            }
            match describe(&device, true) {
                Ok(info) => found.push(info),
                Err(e) => debug!(
                    "Skipping device bus={} addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(found)
    }

    fn device(&self, id: UsbDeviceId) -> Result<Option<UsbDeviceInfo>> {
        match self.find(id) {
            Ok(device) => Ok(Some(describe(&device, false)?)),
            Err(LinkError::ConnectFailed(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn endpoints(&self, id: UsbDeviceId, interface: u8) -> Result<Vec<EndpointInfo>> {
        let device = self.find(id)?;
        let config = device.active_config_descriptor()?;

        let setting = config
            .interfaces()
            .find(|i| i.number() == interface)
            .and_then(|i| i.descriptors().next())
            .ok_or(LinkError::EndpointsNotFound { interface })?;

        Ok(setting
            .endpoint_descriptors()
            .map(|ep| EndpointInfo {
                address: ep.address(),
                direction: match ep.direction() {
                    rusb::Direction::In => Direction::In,
                    rusb::Direction::Out => Direction::Out,
                },
                kind: match ep.transfer_type() {
                    rusb::TransferType::Control => TransferKind::Control,
                    rusb::TransferType::Isochronous => TransferKind::Isochronous,
                    rusb::TransferType::Bulk => TransferKind::Bulk,
                    rusb::TransferType::Interrupt => TransferKind::Interrupt,
                },
                max_packet_size: ep.max_packet_size(),
            })
            .collect())
    }

    fn claim(&self, id: UsbDeviceId, endpoints: BulkEndpoints) -> Result<Arc<dyn Channel>> {
        let device = self.find(id)?;
        let handle = device.open().map_err(|e| {
            warn!("Failed to open USB device {}: {}", id, e);
            match e {
                rusb::Error::Access => LinkError::PermissionDenied(format!("USB device {}", id)),
                e => LinkError::Usb(e),
            }
        })?;
        debug!("Opened USB device {}", id);

        Ok(Arc::new(RusbPipe::claim(handle, id, endpoints)?))
    }

    fn probe_access(&self, id: UsbDeviceId) -> bool {
        match self.find(id).map(|d| d.open()) {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("USB device {} cannot be opened: {}", id, e);
                false
            }
            Err(_) => false,
        }
    }
}

/// A claimed printer interface with its bulk endpoint pair
pub struct RusbPipe {
    /// `None` once the interface has been released
    handle: RwLock<Option<DeviceHandle<Context>>>,
    id: UsbDeviceId,
    endpoints: BulkEndpoints,
    detached: bool,
    closed: AtomicBool,
}

impl RusbPipe {
    /// Detach the kernel driver if one is bound, then claim the interface
    fn claim(
        mut handle: DeviceHandle<Context>,
        id: UsbDeviceId,
        endpoints: BulkEndpoints,
    ) -> Result<Self> {
        let interface = endpoints.interface;

        let detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {} on {}", interface, id);
                handle.detach_kernel_driver(interface)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} on {}: {}", interface, id, e);
            if detached {
                reattach(&mut handle, interface, id);
            }
            return Err(e.into());
        }
        debug!(
            "Claimed interface {} on {} (in {:#04x}, out {:#04x})",
            interface, id, endpoints.bulk_in, endpoints.bulk_out
        );

        Ok(Self {
            handle: RwLock::new(Some(handle)),
            id,
            endpoints,
            detached,
            closed: AtomicBool::new(false),
        })
    }

    /// Release the interface and close the device handle
    ///
    /// Waits for a transfer in flight to time out. Runs once; later calls
    /// find the handle gone.
    fn release(&self) {
        let taken = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = taken else {
            return;
        };

        let interface = self.endpoints.interface;
        match handle.release_interface(interface) {
            Ok(()) => debug!("Released interface {} on {}", interface, self.id),
            Err(e) => warn!("Failed to release interface {} on {}: {}", interface, self.id, e),
        }
        if self.detached {
            reattach(&mut handle, interface, self.id);
        }
    }
}

fn reattach(handle: &mut DeviceHandle<Context>, interface: u8, id: UsbDeviceId) {
    match handle.attach_kernel_driver(interface) {
        Ok(()) => debug!("Reattached kernel driver to interface {} on {}", interface, id),
        Err(e) => debug!(
            "Could not reattach kernel driver to interface {}: {}",
            interface, e
        ),
    }
}

fn io_error(e: rusb::Error) -> io::Error {
    let kind = match e {
        rusb::Error::NoDevice => io::ErrorKind::NotConnected,
        rusb::Error::Timeout => io::ErrorKind::TimedOut,
        rusb::Error::Pipe => io::ErrorKind::BrokenPipe,
        rusb::Error::Interrupted => io::ErrorKind::Interrupted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

/// Write `data` through `write` in bulk-sized chunks
///
/// rusb reports partial progress as a short write, so a transfer that
/// times out moved nothing and is resent unchanged. Retries until the
/// data is out or `closed` is set.
fn write_chunks(
    id: UsbDeviceId,
    data: &[u8],
    closed: &AtomicBool,
    mut write: impl FnMut(&[u8]) -> rusb::Result<usize>,
) -> io::Result<()> {
    for chunk in data.chunks(MAX_BULK_CHUNK) {
        let mut offset = 0;
        let mut stalls = 0u32;
        while offset < chunk.len() {
            if closed.load(Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            match write(&chunk[offset..]) {
                Ok(n) => {
                    if stalls > 0 {
                        debug!("Printer on {} accepting data again", id);
                    }
                    stalls = 0;
                    offset += n;
                }
                Err(rusb::Error::Timeout) => {
                    stalls += 1;
                    if stalls == 1 {
                        warn!("Printer on {} is not accepting data, waiting", id);
                    } else {
                        trace!("Printer on {} still stalled ({} retries)", id, stalls);
                    }
                }
                Err(e) => return Err(io_error(e)),
            }
        }
    }
    Ok(())
}

impl Channel for RusbPipe {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
            let Some(handle) = guard.as_ref() else {
                return Ok(0);
            };
            match handle.read_bulk(self.endpoints.bulk_in, buf, READ_POLL) {
                Ok(0) | Err(rusb::Error::Timeout) => continue,
                Ok(n) => return Ok(n),
                Err(e) => return Err(io_error(e)),
            }
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        write_chunks(self.id, data, &self.closed, |chunk| {
            let guard = self.handle.read().unwrap_or_else(PoisonError::into_inner);
            match guard.as_ref() {
                Some(handle) => handle.write_bulk(self.endpoints.bulk_out, chunk, WRITE_POLL),
                None => Err(rusb::Error::NoDevice),
            }
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Closing USB pipe on {}", self.id);
        self.release();
    }
}

impl Drop for RusbPipe {
    fn drop(&mut self) {
        self.release();
    }
}
