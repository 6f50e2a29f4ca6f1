//! USB printer support
//!
//! Printers expose one interface with a bulk-IN and a bulk-OUT endpoint.
//! This module provides:
//! - Device identity, vendor filters and endpoint selection (`device`)
//! - The libusb backend and claimed-interface pipe (`backend`)
//! - The [`Transport`](crate::Transport) implementation (`transport`)
//! - Hot-plug monitoring on a dedicated thread (`hotplug`)
//! - Attach and permission supervision (`supervisor`)
//!
//! All libusb calls are blocking and run on the link's worker threads or
//! the hot-plug thread, never on an async runtime.

pub mod backend;
pub mod device;
pub mod hotplug;
pub mod supervisor;
pub mod transport;

pub use backend::{MAX_BULK_CHUNK, RusbBackend, RusbPipe, UsbBackend};
pub use device::{
    BulkEndpoints, Direction, EndpointInfo, TransferKind, UsbDeviceId, UsbDeviceInfo, UsbFilter,
    WOOSIM_VENDOR_ID, matches_any, select_bulk_endpoints,
};
pub use hotplug::{HotplugEvent, HotplugMonitor, diff_devices};
pub use supervisor::{AttachPhase, PermissionBroker, RusbPermissionBroker, UsbSupervisor};
pub use transport::{UsbSettings, UsbTarget, UsbTransport};
