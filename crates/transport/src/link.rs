//! Transport and live channel abstractions
//!
//! Every physical medium implements [`Transport`]: a blocking handshake that
//! turns a descriptor into a live [`Channel`]. The link service owns the
//! lifecycle; transports only know how to open, move bytes and close.

use crate::cancel::CancelToken;
use crate::error::Result;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;

/// An open conduit to a printer
///
/// Shared between the reader thread, the writer thread and the link
/// service, so every method takes `&self`.
pub trait Channel: Send + Sync {
    /// Block until at least one byte arrives and copy it into `buf`
    ///
    /// `Ok(0)` means end of stream. After [`close`](Channel::close) a
    /// pending or future call must return promptly with `Ok(0)` or an
    /// error.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole payload before returning
    fn send(&self, data: &[u8]) -> io::Result<()>;

    /// Release the transport resources and unblock a pending `recv`
    ///
    /// Must be idempotent.
    fn close(&self);

    /// Name the peer reported during the handshake, if any
    fn peer_name(&self) -> Option<String> {
        None
    }
}

/// A physical medium that can open channels to printers
pub trait Transport: Send + Sync + 'static {
    /// Identity of the printer to connect to
    type Descriptor: Debug + Clone + Send + 'static;

    /// Short transport name used in logs and thread names
    fn name(&self) -> &'static str;

    /// Perform the blocking handshake
    ///
    /// Runs on the connect thread. Implementations should check
    /// `cancel` between steps and may register a cancel hook to unblock a
    /// long-running system call.
    fn open(&self, target: &Self::Descriptor, cancel: &CancelToken) -> Result<Arc<dyn Channel>>;

    /// Size of the reader thread's reusable receive buffer
    fn recv_buffer_size(&self) -> usize {
        1024
    }
}
