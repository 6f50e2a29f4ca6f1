//! USB hot-plug monitoring
//!
//! [`HotplugMonitor`] runs on its own `usb-hotplug` thread and turns device
//! arrival and removal into [`HotplugEvent`]s on an async channel. Where
//! libusb supports hot-plug it registers a callback and pumps
//! `handle_events`; elsewhere it polls the device list and diffs snapshots.
//!
//! Arrivals are filtered by vendor. Removals are always reported because
//! the descriptor of a departed device may no longer be readable.

use super::backend::{RusbBackend, UsbBackend, describe};
use super::device::{UsbDeviceId, UsbDeviceInfo, UsbFilter, matches_any};
use async_channel::Sender;
use rusb::{Device, Hotplug, HotplugBuilder, UsbContext};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Device list polling interval when libusb has no hot-plug support
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for one `handle_events` call, bounding shutdown latency
const EVENT_PUMP: Duration = Duration::from_millis(100);

/// Something happened to a USB device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    /// A device matching the vendor filter appeared
    Attached(UsbDeviceInfo),
    /// A device left the bus
    Detached(UsbDeviceId),
    /// Answer to a permission request
    Permission { device: UsbDeviceId, granted: bool },
}

/// Handle to the monitor thread; dropping it stops the thread
pub struct HotplugMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HotplugMonitor {
    /// Watch with libusb hot-plug callbacks, falling back to polling
    pub fn start(
        backend: Arc<RusbBackend>,
        filters: Vec<UsbFilter>,
        sink: Sender<HotplugEvent>,
    ) -> io::Result<Self> {
        if !rusb::has_hotplug() {
            info!("libusb has no hot-plug support, polling every {:?}", POLL_INTERVAL);
            return Self::polling(backend, filters, POLL_INTERVAL, sink);
        }
        Self::spawn(move |stop| run_hotplug(&backend, filters, sink, &stop))
    }

    /// Watch by diffing the device list every `interval`
    pub fn polling<B: UsbBackend>(
        backend: Arc<B>,
        filters: Vec<UsbFilter>,
        interval: Duration,
        sink: Sender<HotplugEvent>,
    ) -> io::Result<Self> {
        let baseline = snapshot(backend.as_ref(), &filters).unwrap_or_default();
        debug!("USB poll baseline: {} devices", baseline.len());
        Self::spawn(move |stop| {
            run_polling(backend.as_ref(), &filters, baseline, interval, &sink, &stop)
        })
    }

    fn spawn(body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("usb-hotplug".to_string())
                .spawn(move || body(stop))?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("USB hot-plug thread panicked");
        }
    }
}

impl Drop for HotplugMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct HotplugCallback {
    filters: Vec<UsbFilter>,
    sink: Sender<HotplugEvent>,
}

impl HotplugCallback {
    fn post(&self, event: HotplugEvent) {
        if self.sink.try_send(event).is_err() {
            debug!("Hot-plug event dropped, receiver gone");
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        match describe(&device, false) {
            Ok(info) if matches_any(&self.filters, info.vendor_id, info.product_id) => {
                info!("USB device attached: {}", info.label());
                self.post(HotplugEvent::Attached(info));
            }
            Ok(info) => debug!("Device ignored by filter: {}", info.label()),
            Err(e) => debug!(
                "Hot-plug: cannot read descriptor of bus={} addr={}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let id = UsbDeviceId::new(device.bus_number(), device.address());
        debug!("USB device left: {}", id);
        self.post(HotplugEvent::Detached(id));
    }
}

fn run_hotplug(
    backend: &RusbBackend,
    filters: Vec<UsbFilter>,
    sink: Sender<HotplugEvent>,
    stop: &AtomicBool,
) {
    let callback = HotplugCallback { filters, sink };
    let _registration: rusb::Registration<rusb::Context> = match HotplugBuilder::new()
        .enumerate(false)
        .register(backend.context(), Box::new(callback))
    {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register hot-plug callback: {}", e);
            return;
        }
    };
    info!("USB hot-plug monitor started");

    while !stop.load(Ordering::SeqCst) {
        match backend.context().handle_events(Some(EVENT_PUMP)) {
            Ok(()) | Err(rusb::Error::Interrupted) => {}
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                thread::sleep(EVENT_PUMP);
            }
        }
    }

    info!("USB hot-plug monitor stopped");
}

fn run_polling<B: UsbBackend>(
    backend: &B,
    filters: &[UsbFilter],
    mut known: Vec<UsbDeviceInfo>,
    interval: Duration,
    sink: &Sender<HotplugEvent>,
    stop: &AtomicBool,
) {
    loop {
        let next_poll = Instant::now() + interval;
        while Instant::now() < next_poll {
            if stop.load(Ordering::SeqCst) {
                debug!("USB poll monitor stopped");
                return;
            }
            thread::sleep(EVENT_PUMP.min(interval));
        }

        let Some(current) = snapshot(backend, filters) else {
            continue;
        };
        for event in diff_devices(&known, &current) {
            if sink.try_send(event).is_err() {
                debug!("Hot-plug receiver gone, stopping poll");
                return;
            }
        }
        known = current;
    }
}

fn snapshot<B: UsbBackend>(backend: &B, filters: &[UsbFilter]) -> Option<Vec<UsbDeviceInfo>> {
    match backend.devices() {
        Ok(devices) => Some(
            devices
                .into_iter()
                .filter(|d| matches_any(filters, d.vendor_id, d.product_id))
                .collect(),
        ),
        Err(e) => {
            warn!("Failed to list USB devices: {}", e);
            None
        }
    }
}

/// Events that turn the `previous` device list into `current`
///
/// Removals come first so a re-plugged device that kept its address is
/// reported as detached and then attached.
pub fn diff_devices(previous: &[UsbDeviceInfo], current: &[UsbDeviceInfo]) -> Vec<HotplugEvent> {
    let same = |a: &UsbDeviceInfo, b: &UsbDeviceInfo| {
        a.id == b.id && a.vendor_id == b.vendor_id && a.product_id == b.product_id
    };

    let detached = previous
        .iter()
        .filter(|old| !current.iter().any(|new| same(old, new)))
        .map(|old| HotplugEvent::Detached(old.id));
    let attached = current
        .iter()
        .filter(|new| !previous.iter().any(|old| same(old, new)))
        .map(|new| HotplugEvent::Attached(new.clone()));

    detached.chain(attached).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockUsbBackend;

    fn printer(bus: u8, address: u8) -> UsbDeviceInfo {
        MockUsbBackend::printer_info(bus, address)
    }

    #[test]
    fn test_diff_no_change() {
        let devices = vec![printer(1, 2), printer(1, 3)];
        assert!(diff_devices(&devices, &devices).is_empty());
    }

    #[test]
    fn test_diff_attach_and_detach() {
        let events = diff_devices(&[printer(1, 2)], &[printer(1, 3)]);
        assert_eq!(
            events,
            vec![
                HotplugEvent::Detached(UsbDeviceId::new(1, 2)),
                HotplugEvent::Attached(printer(1, 3)),
            ]
        );
    }

    #[test]
    fn test_diff_address_reused_by_other_device() {
        let mut other = printer(1, 2);
        other.product_id = 0x99;
        let events = diff_devices(&[printer(1, 2)], &[other.clone()]);
        assert_eq!(
            events,
            vec![
                HotplugEvent::Detached(UsbDeviceId::new(1, 2)),
                HotplugEvent::Attached(other),
            ]
        );
    }

    #[test]
    fn test_polling_monitor_reports_changes() {
        let backend = Arc::new(MockUsbBackend::new());
        let (tx, rx) = async_channel::unbounded();
        let monitor = HotplugMonitor::polling(
            Arc::clone(&backend),
            vec![UsbFilter::default()],
            Duration::from_millis(20),
            tx,
        )
        .unwrap();

        let id = backend.add_printer(1, 7);
        let mut foreign = printer(1, 8);
        foreign.vendor_id = 0x04b8;
        backend.add_device(foreign, Vec::new());

        let event = rx.recv_blocking().unwrap();
        assert!(matches!(event, HotplugEvent::Attached(ref info) if info.id == id));

        backend.remove_device(id);
        assert_eq!(rx.recv_blocking().unwrap(), HotplugEvent::Detached(id));

        monitor.stop();
        assert!(rx.try_recv().is_err());
    }
}
