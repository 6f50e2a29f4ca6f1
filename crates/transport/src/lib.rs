//! Printer link transports
//!
//! One connection lifecycle for receipt printers over three media:
//! Bluetooth RFCOMM, USB bulk endpoints and raw TCP. A [`LinkService`] owns
//! the state machine (`None -> Connecting -> Connected`) and runs the
//! blocking handshake and the connected I/O on worker threads. Results come
//! back to the owner as [`LinkEvent`]s on one ordered channel.
//!
//! - [`LinkService`]: connect, write, stop, state
//! - [`Transport`] / [`Channel`]: the seam each medium implements
//! - [`TcpTransport`], [`RfcommTransport`], [`UsbTransport`]: the media
//! - [`usb::UsbSupervisor`]: follows USB attach, permission and detach
//!
//! [`LinkEvent`]: common::LinkEvent

pub mod bluetooth;
pub mod cancel;
pub mod error;
pub mod link;
pub mod service;
pub mod tcp;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;
mod worker;

pub use bluetooth::{BdAddr, BluetoothSettings, RfcommTarget, RfcommTransport};
pub use cancel::CancelToken;
pub use error::{LinkError, Result};
pub use link::{Channel, Transport};
pub use service::{LinkService, LinkStatus};
pub use tcp::{TcpChannel, TcpSettings, TcpTarget, TcpTransport};
pub use usb::{UsbFilter, UsbSettings, UsbTarget, UsbTransport};
