//! TCP/Wi-Fi transport
//!
//! Network printers listen on a raw TCP port (9100 by convention). The
//! handshake resolves the host, then connects with a bounded timeout so an
//! unreachable printer fails in about two seconds instead of waiting for
//! the OS connect timeout. Name lookup shares that deadline and runs on a
//! helper thread, so a stalled resolver neither outlives the timeout nor
//! delays cancellation. Resolution failures and connect failures are
//! reported separately.

use crate::cancel::CancelToken;
use crate::error::{LinkError, Result};
use crate::link::{Channel, Transport};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Raw printing port used by most network receipt printers
pub const DEFAULT_PORT: u16 = 9100;

/// Upper bound on a whole connect attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default receive buffer size (bytes)
pub const DEFAULT_RECV_BUFFER: usize = 1024;

/// How often a pending name lookup re-checks for cancellation
const RESOLVE_POLL: Duration = Duration::from_millis(20);

/// Network address of a printer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpTarget {
    pub host: String,
    pub port: u16,
}

impl TcpTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Build a target from separately entered host and port strings
    pub fn parse(host: &str, port: &str) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(LinkError::InvalidTarget("empty host".to_string()));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| LinkError::InvalidTarget(format!("invalid port '{}'", port)))?;
        Ok(Self::new(host, port))
    }
}

impl FromStr for TcpTarget {
    type Err = LinkError;

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| LinkError::InvalidTarget(format!("unterminated '[' in '{}'", s)))?;
            return match tail.strip_prefix(':') {
                Some(port) => Self::parse(host, port),
                None if tail.is_empty() => Self::parse(host, &DEFAULT_PORT.to_string()),
                None => Err(LinkError::InvalidTarget(format!("unexpected '{}'", tail))),
            };
        }

        match s.rsplit_once(':') {
            // A bare IPv6 address has several colons and no port
            Some((host, _)) if host.contains(':') => Self::parse(s, &DEFAULT_PORT.to_string()),
            Some((host, port)) => Self::parse(host, port),
            None => Self::parse(s, &DEFAULT_PORT.to_string()),
        }
    }
}

impl fmt::Display for TcpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// TCP transport tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSettings {
    pub connect_timeout: Duration,
    pub recv_buffer: usize,
}

impl Default for TcpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_buffer: DEFAULT_RECV_BUFFER,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    settings: TcpSettings,
}

impl TcpTransport {
    pub fn new(settings: TcpSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }
}

impl Transport for TcpTransport {
    type Descriptor = TcpTarget;

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn open(&self, target: &TcpTarget, cancel: &CancelToken) -> Result<Arc<dyn Channel>> {
        let deadline = Instant::now() + self.settings.connect_timeout;
        let addrs = resolve(target, deadline, cancel)?;
        let mut last_error = None;

        for addr in addrs {
            if cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            debug!("Connecting to {} (timeout {:?})", addr, remaining);
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(stream) => return Ok(Arc::new(TcpChannel::new(stream)?)),
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(LinkError::ConnectFailed(match last_error {
            Some(e) => format!("{}: {}", target, e),
            None => format!("{}: timed out", target),
        }))
    }

    fn recv_buffer_size(&self) -> usize {
        self.settings.recv_buffer
    }
}

/// Resolve `target` to socket addresses before `deadline`
///
/// IP literals skip the resolver. Otherwise the lookup runs on its own
/// thread; if it is abandoned on cancel or timeout that thread finishes
/// the lookup and exits on its own.
fn resolve(target: &TcpTarget, deadline: Instant, cancel: &CancelToken) -> Result<Vec<SocketAddr>> {
    if cancel.is_cancelled() {
        return Err(LinkError::Cancelled);
    }
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, target.port)]);
    }

    let (tx, rx) = mpsc::channel();
    let query = (target.host.clone(), target.port);
    thread::Builder::new()
        .name("tcp-resolve".to_string())
        .spawn(move || {
            let result = (query.0.as_str(), query.1)
                .to_socket_addrs()
                .map(Iterator::collect::<Vec<_>>);
            // The caller may have given up already
            let _ = tx.send(result);
        })?;

    loop {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!("Lookup of {} timed out", target.host);
            return Err(LinkError::UnknownHost(format!("{}: lookup timed out", target.host)));
        }

        match rx.recv_timeout(remaining.min(RESOLVE_POLL)) {
            Ok(Ok(addrs)) if addrs.is_empty() => {
                return Err(LinkError::UnknownHost(target.host.clone()));
            }
            Ok(Ok(addrs)) => return Ok(addrs),
            Ok(Err(e)) => return Err(LinkError::UnknownHost(format!("{}: {}", target.host, e))),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(LinkError::UnknownHost(target.host.clone()));
            }
        }
    }
}

/// Live TCP connection
pub struct TcpChannel {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpChannel {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: AtomicBool::new(false),
        })
    }
}

impl Channel for TcpChannel {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let mut stream = &self.stream;
        stream.write_all(data)?;
        stream.flush()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wakes a reader blocked in recv
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("TCP shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let target = TcpTarget::parse("192.168.0.10", "9100").unwrap();
        assert_eq!(target, TcpTarget::new("192.168.0.10", 9100));

        let target = TcpTarget::parse(" printer.local ", " 6101 ").unwrap();
        assert_eq!(target, TcpTarget::new("printer.local", 6101));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            TcpTarget::parse("", "9100"),
            Err(LinkError::InvalidTarget(_))
        ));
        assert!(TcpTarget::parse("host", "port").is_err());
        assert!(TcpTarget::parse("host", "0").is_err());
        assert!(TcpTarget::parse("host", "70000").is_err());
    }

    #[test]
    fn test_from_str() {
        assert_eq!(
            "10.0.0.5:9101".parse::<TcpTarget>().unwrap(),
            TcpTarget::new("10.0.0.5", 9101)
        );
        assert_eq!(
            "10.0.0.5".parse::<TcpTarget>().unwrap(),
            TcpTarget::new("10.0.0.5", DEFAULT_PORT)
        );
        assert_eq!(
            "[::1]:9200".parse::<TcpTarget>().unwrap(),
            TcpTarget::new("::1", 9200)
        );
        assert_eq!(
            "fe80::1".parse::<TcpTarget>().unwrap(),
            TcpTarget::new("fe80::1", DEFAULT_PORT)
        );
        assert!("[::1".parse::<TcpTarget>().is_err());
    }

    #[test]
    fn test_display_round_trips() {
        for s in ["printer:9100", "[::1]:9100"] {
            assert_eq!(s.parse::<TcpTarget>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_default_settings() {
        let settings = TcpSettings::default();
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
        assert_eq!(settings.recv_buffer, 1024);
    }

    #[test]
    fn test_resolve_ip_literal() {
        let deadline = Instant::now() + DEFAULT_CONNECT_TIMEOUT;
        let addrs = resolve(&TcpTarget::new("::1", 9100), deadline, &CancelToken::new()).unwrap();
        assert_eq!(addrs, vec!["[::1]:9100".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_resolve_honours_cancel_and_deadline() {
        let target = TcpTarget::new("printer.invalid", 9100);

        let cancelled = CancelToken::new();
        cancelled.cancel();
        let deadline = Instant::now() + DEFAULT_CONNECT_TIMEOUT;
        assert!(matches!(
            resolve(&target, deadline, &cancelled),
            Err(LinkError::Cancelled)
        ));

        let expired = Instant::now();
        assert!(matches!(
            resolve(&target, expired, &CancelToken::new()),
            Err(LinkError::UnknownHost(_))
        ));
    }

    #[test]
    fn test_open_cancelled_before_lookup() {
        let transport = TcpTransport::default();
        let token = CancelToken::new();
        token.cancel();
        let result = transport.open(&TcpTarget::new("printer.invalid", 9100), &token);
        assert!(matches!(result, Err(LinkError::Cancelled)));
    }

    #[test]
    fn test_channel_close_unblocks_recv() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).unwrap();
        let (_peer, _) = listener.accept().unwrap();

        let channel = Arc::new(TcpChannel::new(stream).unwrap());
        let reader = {
            let channel = channel.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 16];
                channel.recv(&mut buf)
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        channel.close();
        channel.close();

        let result = reader.join().unwrap();
        assert!(matches!(result, Ok(0) | Err(_)));
        assert!(channel.send(b"x").is_err());
    }
}
