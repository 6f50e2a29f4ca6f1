//! Link worker threads
//!
//! A connect thread runs one transport handshake and hands the result back
//! to the link core. Once connected, a reader thread loops on the channel's
//! receive call and a writer thread drains the outbound queue, so writes
//! from any caller thread reach the channel one whole payload at a time.
//!
//! Workers never change link state directly: every state change and every
//! event goes through [`Core`], which checks that the worker's session is
//! still the current one.

use crate::cancel::CancelToken;
use crate::error::LinkError;
use crate::link::{Channel, Transport};
use crate::service::Core;
use async_channel::{Receiver, Sender, unbounded};
use bytes::Bytes;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Spawn the thread that performs one connect attempt
pub(crate) fn spawn_connect<T: Transport>(
    core: Arc<Core>,
    transport: Arc<T>,
    session_id: u64,
    target: T::Descriptor,
    token: Arc<CancelToken>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{}-connect", transport.name()))
        .spawn(move || {
            debug!("Session {}: connecting to {:?}", session_id, target);

            let result = if token.is_cancelled() {
                Err(LinkError::Cancelled)
            } else {
                transport.open(&target, &token)
            };
            token.clear_hook();

            core.finish_connect(session_id, &token, result, transport.recv_buffer_size());
        })
}

/// Reader and writer threads that own a live channel
pub(crate) struct ConnectedWorker {
    channel: Arc<dyn Channel>,
    outbound: Sender<Bytes>,
    /// Payloads queued or being written
    pending: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ConnectedWorker {
    /// Start the reader and writer threads for a freshly opened channel
    pub(crate) fn start(
        core: Arc<Core>,
        session_id: u64,
        channel: Arc<dyn Channel>,
        recv_buffer_size: usize,
    ) -> io::Result<Self> {
        let (outbound, queue) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));

        let writer = {
            let core = Arc::clone(&core);
            let channel = Arc::clone(&channel);
            let pending = Arc::clone(&pending);
            thread::Builder::new()
                .name("link-writer".to_string())
                .spawn(move || write_loop(core, session_id, channel, queue, pending))?
        };

        let reader = {
            let channel = Arc::clone(&channel);
            thread::Builder::new()
                .name("link-reader".to_string())
                .spawn(move || read_loop(core, session_id, channel, recv_buffer_size))
        };

        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                outbound.close();
                channel.close();
                return Err(e);
            }
        };

        Ok(Self {
            channel,
            outbound,
            pending,
            reader,
            writer,
        })
    }

    /// Queue a payload for the writer thread
    pub(crate) fn enqueue(&self, data: Bytes) -> Result<(), LinkError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.outbound.try_send(data).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            LinkError::ConnectionLost
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Close the channel and the outbound queue
    ///
    /// Returns the thread handles so the caller can join them later.
    pub(crate) fn cancel(self) -> [JoinHandle<()>; 2] {
        self.outbound.close();
        self.channel.close();
        [self.reader, self.writer]
    }
}

fn read_loop(core: Arc<Core>, session_id: u64, channel: Arc<dyn Channel>, buffer_size: usize) {
    let mut scratch = vec![0u8; buffer_size.max(1)];

    loop {
        match channel.recv(&mut scratch) {
            Ok(0) => {
                debug!("Session {}: end of stream", session_id);
                break;
            }
            Ok(n) => {
                // The scratch buffer is overwritten by the next read
                let frame = Bytes::copy_from_slice(&scratch[..n]);
                trace!("Session {}: received {} bytes", session_id, n);
                if !core.deliver(session_id, frame) {
                    debug!("Session {}: superseded, reader exiting", session_id);
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Session {}: receive failed: {}", session_id, e);
                break;
            }
        }
    }

    core.connection_lost(session_id);
}

fn write_loop(
    core: Arc<Core>,
    session_id: u64,
    channel: Arc<dyn Channel>,
    queue: Receiver<Bytes>,
    pending: Arc<AtomicUsize>,
) {
    while let Ok(data) = queue.recv_blocking() {
        match channel.send(&data) {
            Ok(()) => {
                pending.fetch_sub(1, Ordering::SeqCst);
                trace!("Session {}: wrote {} bytes", session_id, data.len());
            }
            Err(e) => {
                warn!(
                    "Session {}: write of {} bytes failed: {}",
                    session_id,
                    data.len(),
                    e
                );
                // Teardown closes the channel. The session is retired before
                // the count drops, so a zero count seen while still connected
                // means every write landed.
                core.connection_lost(session_id);
                pending.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        }
    }
    debug!("Session {}: outbound queue closed, writer exiting", session_id);
}
