//! # Bluetooth RFCOMM Transport
//!
//! Connects to Serial Port Profile printers over an RFCOMM stream socket
//! (`AF_BLUETOOTH`, `BTPROTO_RFCOMM`). The printer must already be paired;
//! pairing and discovery are left to the OS tools:
//!
//! ```bash
//! $ bluetoothctl
//! [bluetooth]# scan on
//! [bluetooth]# pair 00:15:0E:XX:XX:XX
//! ```
//!
//! ## Cancellation
//!
//! `connect(2)` on an RFCOMM socket can block for many seconds while the
//! baseband pages the printer. The transport registers a cancel hook that
//! shuts the socket down, which makes the pending connect fail at once.
//!
//! ## Remote Name
//!
//! After connecting, the printer's advertised name is looked up with
//! `bluetoothctl info`, falling back to the configured name and finally the
//! address.

use crate::cancel::CancelToken;
use crate::error::{LinkError, Result};
use crate::link::{Channel, Transport};
use std::fmt;
use std::process::{Command, Output, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Standard RFCOMM channel for SPP printers
pub const DEFAULT_CHANNEL: u8 = 1;

/// Default receive buffer size (bytes)
pub const DEFAULT_RECV_BUFFER: usize = 1024;

/// How long to wait for `bluetoothctl` before giving up on the name
const NAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(1);

/// Bluetooth device address, stored most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Byte order used by `bdaddr_t` in the kernel socket API
    pub fn to_le_bytes(self) -> [u8; 6] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }
}

impl FromStr for BdAddr {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        if !is_valid_mac(s) {
            return Err(LinkError::InvalidTarget(format!(
                "invalid Bluetooth address '{}', expected XX:XX:XX:XX:XX:XX",
                s
            )));
        }
        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(s.split(':')) {
            *byte = u8::from_str_radix(part, 16)
                .map_err(|e| LinkError::InvalidTarget(format!("'{}': {}", s, e)))?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Validate a Bluetooth MAC address format (XX:XX:XX:XX:XX:XX).
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return false;
    }
    parts
        .iter()
        .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Paired printer to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RfcommTarget {
    pub address: BdAddr,
    pub channel: u8,
    /// Name to report if the advertised name cannot be read
    pub name: Option<String>,
}

impl RfcommTarget {
    pub fn new(address: BdAddr) -> Self {
        Self {
            address,
            channel: DEFAULT_CHANNEL,
            name: None,
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Bluetooth transport tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BluetoothSettings {
    pub recv_buffer: usize,
    /// Ask `bluetoothctl` for the advertised name after connecting
    pub resolve_name: bool,
}

impl Default for BluetoothSettings {
    fn default() -> Self {
        Self {
            recv_buffer: DEFAULT_RECV_BUFFER,
            resolve_name: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RfcommTransport {
    settings: BluetoothSettings,
}

impl RfcommTransport {
    pub fn new(settings: BluetoothSettings) -> Self {
        Self { settings }
    }

    fn peer_name(&self, target: &RfcommTarget) -> String {
        self.settings
            .resolve_name
            .then(|| lookup_remote_name(&target.address))
            .flatten()
            .or_else(|| target.name.clone())
            .unwrap_or_else(|| target.address.to_string())
    }
}

impl Transport for RfcommTransport {
    type Descriptor = RfcommTarget;

    fn name(&self) -> &'static str {
        "rfcomm"
    }

    #[cfg(target_os = "linux")]
    fn open(&self, target: &RfcommTarget, cancel: &CancelToken) -> Result<Arc<dyn Channel>> {
        let socket = Arc::new(sys::RfcommSocket::new().map_err(|e| {
            LinkError::ConnectFailed(format!("cannot create RFCOMM socket: {}", e))
        })?);

        {
            let socket = Arc::clone(&socket);
            cancel.on_cancel(move || socket.shutdown());
        }

        debug!(
            "RFCOMM connect to {} channel {}",
            target.address, target.channel
        );
        socket
            .connect(&target.address, target.channel)
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EACCES) | Some(libc::EPERM) => {
                    LinkError::PermissionDenied(format!("{}: {}", target.address, e))
                }
                _ => LinkError::ConnectFailed(format!("{}: {}", target.address, e)),
            })?;
        cancel.clear_hook();

        if cancel.is_cancelled() {
            socket.shutdown();
            return Err(LinkError::Cancelled);
        }

        let name = self.peer_name(target);
        Ok(Arc::new(sys::RfcommChannel::new(socket, name)))
    }

    #[cfg(not(target_os = "linux"))]
    fn open(&self, _target: &RfcommTarget, _cancel: &CancelToken) -> Result<Arc<dyn Channel>> {
        Err(LinkError::ConnectFailed(
            "RFCOMM sockets are only supported on Linux".to_string(),
        ))
    }

    fn recv_buffer_size(&self) -> usize {
        self.settings.recv_buffer
    }
}

/// Look up the advertised name of a paired device via `bluetoothctl info`
pub fn lookup_remote_name(address: &BdAddr) -> Option<String> {
    let mut command = Command::new("bluetoothctl");
    command.arg("info").arg(address.to_string());
    let output = run_with_timeout(command, NAME_LOOKUP_TIMEOUT)?;
    if !output.status.success() {
        return None;
    }
    parse_info_name(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the `Name:` field from `bluetoothctl info` output
fn parse_info_name(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.trim().strip_prefix("Name:"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// `bluetoothctl` waits forever when bluetoothd is not running
fn run_with_timeout(mut command: Command, timeout: Duration) -> Option<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| debug!("Failed to run {:?}: {}", command, e))
        .ok()?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return child.wait_with_output().ok(),
            Ok(None) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(20)),
            Ok(None) | Err(_) => {
                debug!("{:?} did not finish in {:?}", command, timeout);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::BdAddr;
    use crate::link::Channel;
    use nix::errno::Errno;
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing::debug;

    /// Not exported by libc
    const BTPROTO_RFCOMM: libc::c_int = 3;

    /// `struct sockaddr_rc` from <bluetooth/rfcomm.h>
    #[repr(C)]
    struct SockaddrRc {
        rc_family: libc::sa_family_t,
        rc_bdaddr: [u8; 6],
        rc_channel: u8,
    }

    pub(super) struct RfcommSocket {
        fd: OwnedFd,
    }

    impl RfcommSocket {
        pub(super) fn new() -> io::Result<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_BLUETOOTH,
                    libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                    BTPROTO_RFCOMM,
                )
            };
            let fd = Errno::result(fd)?;
            // SAFETY: fd was just returned by socket(2) and is owned by nobody else
            Ok(Self {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        pub(super) fn connect(&self, address: &BdAddr, channel: u8) -> io::Result<()> {
            let addr = SockaddrRc {
                rc_family: libc::AF_BLUETOOTH as libc::sa_family_t,
                rc_bdaddr: address.to_le_bytes(),
                rc_channel: channel,
            };
            let rc = unsafe {
                libc::connect(
                    self.fd.as_raw_fd(),
                    &addr as *const SockaddrRc as *const libc::sockaddr,
                    std::mem::size_of::<SockaddrRc>() as libc::socklen_t,
                )
            };
            Errno::result(rc)?;
            Ok(())
        }

        /// Wake any thread blocked on this socket; the fd stays open
        pub(super) fn shutdown(&self) {
            let rc = unsafe { libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR) };
            if let Err(e) = Errno::result(rc) {
                debug!("RFCOMM shutdown: {}", e);
            }
        }
    }

    /// Live RFCOMM connection
    ///
    /// The descriptor is only closed when the last reference drops, after
    /// the reader and writer threads are done with it.
    pub(super) struct RfcommChannel {
        socket: Arc<RfcommSocket>,
        closed: AtomicBool,
        name: String,
    }

    impl RfcommChannel {
        pub(super) fn new(socket: Arc<RfcommSocket>, name: String) -> Self {
            Self {
                socket,
                closed: AtomicBool::new(false),
                name,
            }
        }
    }

    impl Channel for RfcommChannel {
        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::recv(
                    self.socket.fd.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    0,
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        fn send(&self, data: &[u8]) -> io::Result<()> {
            let mut offset = 0;
            while offset < data.len() {
                if self.closed.load(Ordering::SeqCst) {
                    return Err(io::Error::from(io::ErrorKind::NotConnected));
                }
                let rest = &data[offset..];
                let n = unsafe {
                    libc::send(
                        self.socket.fd.as_raw_fd(),
                        rest.as_ptr().cast(),
                        rest.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                offset += n as usize;
            }
            Ok(())
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.socket.shutdown();
            }
        }

        fn peer_name(&self) -> Option<String> {
            Some(self.name.clone())
        }
    }
}
