//! Interactive printer console
//!
//! Reads commands from stdin, forwards them to a [`PrinterLink`] and prints
//! link notifications as they arrive. The same loop drives one-shot
//! `--send` runs: the file is written once the link is up and the process
//! exits when the writer has drained it.

use anyhow::{Context, Result, anyhow};
use async_channel::Receiver;
use bytes::Bytes;
use common::{FailureReason, LinkEvent, LinkState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info, warn};
use transport::usb::{
    AttachPhase, HotplugEvent, HotplugMonitor, RusbBackend, RusbPermissionBroker, UsbSupervisor,
};
use transport::{LinkService, Transport};

/// How often a `--send` run checks whether the outbound queue has drained
const DRAIN_POLL: Duration = Duration::from_millis(20);

const HELP: &str = "\
Commands:
    text <words>   print a line of text (LF appended)
    hex <bytes>    send raw bytes, e.g. 'hex 1b 40'
    send <file>    send the contents of a file
    state          show the link state
    connect        connect again
    stop           stop the link
    help           show this help
    quit           exit";

/// One line of console input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(PathBuf),
    Hex(Vec<u8>),
    Text(String),
    State,
    Stop,
    Connect,
    Help,
    Quit,
}

/// Parse a console line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "text" | "t" => ConsoleCommand::Text(rest.to_string()),
        "hex" | "x" => ConsoleCommand::Hex(parse_hex(rest)?),
        "send" | "s" => {
            if rest.is_empty() {
                return Err(anyhow!("send needs a file path"));
            }
            ConsoleCommand::Send(PathBuf::from(shellexpand::tilde(rest).as_ref()))
        }
        "state" => ConsoleCommand::State,
        "stop" => ConsoleCommand::Stop,
        "connect" | "c" => ConsoleCommand::Connect,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(anyhow!("unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}

/// Parse hex bytes separated by whitespace, commas or nothing at all
pub fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|part| {
            part.strip_prefix("0x")
                .or_else(|| part.strip_prefix("0X"))
                .unwrap_or(part)
        })
        .collect();

    if digits.is_empty() {
        return Err(anyhow!("no hex bytes given"));
    }
    if digits.len() % 2 != 0 {
        return Err(anyhow!("odd number of hex digits in '{}'", input));
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|_| anyhow!("invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

/// Format bytes as space separated lowercase hex
pub fn format_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A printer link the console can drive
pub trait PrinterLink: Send + 'static {
    type Transport: Transport;

    fn service(&self) -> &LinkService<Self::Transport>;

    /// Start (or restart) connecting to the configured printer
    fn connect(&mut self) -> Result<()>;

    fn stop(&mut self);

    /// Called with every link notification before it is printed
    fn on_link_event(&mut self, _event: &LinkEvent) {}

    fn on_hotplug(&mut self, _event: HotplugEvent) {}

    /// Device notifications to wait on, if this link follows hot-plug
    fn hotplug_events(&self) -> Option<Receiver<HotplugEvent>> {
        None
    }

    /// One line describing where the link stands
    fn describe(&self) -> String {
        self.service().state().to_string()
    }

    /// Stop the link and join its worker threads
    fn shutdown(self);
}

/// A link to one fixed printer address
pub struct DirectLink<T: Transport> {
    service: LinkService<T>,
    target: T::Descriptor,
}

impl<T: Transport> DirectLink<T> {
    pub fn new(transport: T, target: T::Descriptor) -> Self {
        Self {
            service: LinkService::new(transport),
            target,
        }
    }
}

impl<T: Transport> PrinterLink for DirectLink<T> {
    type Transport = T;

    fn service(&self) -> &LinkService<T> {
        &self.service
    }

    fn connect(&mut self) -> Result<()> {
        self.service.connect(self.target.clone());
        Ok(())
    }

    fn stop(&mut self) {
        self.service.stop();
    }

    fn describe(&self) -> String {
        format!("{} ({:?})", self.service.state(), self.target)
    }

    fn shutdown(self) {
        self.service.shutdown();
    }
}

type RusbSupervisor = UsbSupervisor<RusbBackend, RusbPermissionBroker<RusbBackend>>;

/// A USB link that follows printers as they are plugged in and out
pub struct UsbLink {
    supervisor: RusbSupervisor,
    monitor: Option<HotplugMonitor>,
    hotplug: Receiver<HotplugEvent>,
}

impl UsbLink {
    pub fn new(
        supervisor: RusbSupervisor,
        monitor: HotplugMonitor,
        hotplug: Receiver<HotplugEvent>,
    ) -> Self {
        Self {
            supervisor,
            monitor: Some(monitor),
            hotplug,
        }
    }
}

impl PrinterLink for UsbLink {
    type Transport = transport::UsbTransport<RusbBackend>;

    fn service(&self) -> &LinkService<Self::Transport> {
        self.supervisor.service()
    }

    /// Forget the current device and offer whatever is plugged in now
    fn connect(&mut self) -> Result<()> {
        self.supervisor.stop();
        self.supervisor
            .rescan()
            .context("Failed to enumerate USB devices")?;
        if self.supervisor.phase() == AttachPhase::Idle {
            println!("Waiting for a matching USB printer to be attached...");
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.supervisor.stop();
    }

    fn on_link_event(&mut self, event: &LinkEvent) {
        self.supervisor.handle_link_event(event);
    }

    fn on_hotplug(&mut self, event: HotplugEvent) {
        match &event {
            HotplugEvent::Attached(info) => println!("USB attached: {} at {}", info.label(), info.id),
            HotplugEvent::Detached(id) if self.supervisor.phase().device() == Some(*id) => {
                println!("USB detached: {}", id)
            }
            HotplugEvent::Detached(_) => {}
            HotplugEvent::Permission { .. } => {}
        }
        self.supervisor.handle_hotplug(event);
    }

    fn hotplug_events(&self) -> Option<Receiver<HotplugEvent>> {
        Some(self.hotplug.clone())
    }

    fn describe(&self) -> String {
        format!("{} ({:?})", self.service().state(), self.supervisor.phase())
    }

    fn shutdown(mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.supervisor.shutdown();
    }
}

/// Print a link notification for the user
pub fn render_event(event: &LinkEvent) -> String {
    match event {
        LinkEvent::ConnectedTo(name) => format!("Connected to {}", name),
        LinkEvent::Connected => "Connected".to_string(),
        LinkEvent::Failure(reason) => format!("Link failure: {}", reason),
        LinkEvent::Received(frame) => format!("<< {}", format_hex(frame)),
    }
}

async fn next_hotplug(rx: &Option<Receiver<HotplugEvent>>) -> Option<HotplugEvent> {
    match rx {
        Some(rx) => rx.recv().await.ok(),
        None => std::future::pending().await,
    }
}

/// Write `data` and report what happened
fn write_payload<L: PrinterLink>(link: &L, data: Bytes) {
    let len = data.len();
    match link.service().write(data) {
        Ok(()) => debug!("Queued {} bytes", len),
        Err(e) => println!("Write failed: {}", e),
    }
}

/// Run `command`; returns false when the console should exit
fn execute<L: PrinterLink>(link: &mut L, command: ConsoleCommand) -> Result<bool> {
    match command {
        ConsoleCommand::Text(text) => {
            let mut line = text.into_bytes();
            line.push(b'\n');
            write_payload(link, Bytes::from(line));
        }
        ConsoleCommand::Hex(data) => write_payload(link, Bytes::from(data)),
        ConsoleCommand::Send(path) => match std::fs::read(&path) {
            Ok(data) => {
                println!("Sending {} bytes from {}", data.len(), path.display());
                write_payload(link, Bytes::from(data));
            }
            Err(e) => println!("Cannot read {}: {}", path.display(), e),
        },
        ConsoleCommand::State => {
            let status = link.service().status();
            println!(
                "{} (session {}, {} writes pending)",
                link.describe(),
                status.session_id,
                link.service().pending_writes()
            );
        }
        ConsoleCommand::Stop => {
            link.stop();
            println!("Stopped");
        }
        ConsoleCommand::Connect => link.connect()?,
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return Ok(false),
    }
    Ok(true)
}

/// Drive `link` until the user quits, stdin closes or Ctrl+C
///
/// With `send` set, stdin is ignored: the file is written as soon as the
/// link connects and the run ends once every byte has been handed to the
/// transport on that same connection. A connect failure, or losing the
/// link before the writer drained, ends a `send` run with an error.
pub async fn run<L: PrinterLink>(mut link: L, send: Option<PathBuf>) -> Result<()> {
    let payload = match &send {
        Some(path) => Some(Bytes::from(
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
        )),
        None => None,
    };
    let interactive = payload.is_none();
    let mut payload = payload;

    let events = link.service().events();
    let hotplug = link.hotplug_events();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = interactive;
    // Session the payload was queued on
    let mut sent_on: Option<u64> = None;
    let mut drain_tick = tokio::time::interval(DRAIN_POLL);

    link.connect()?;
    if interactive {
        println!("Type 'help' for commands");
    }

    let outcome: Result<()> = loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => break Err(anyhow!("Link event channel closed: {}", e)),
                };
                link.on_link_event(&event);
                println!("{}", render_event(&event));

                if let LinkEvent::Failure(reason) = event
                    && !interactive
                    && reason != FailureReason::NotConnected
                {
                    break Err(anyhow!("Printing failed: {}", reason));
                }

                if event.is_connected()
                    && let Some(data) = payload.take()
                {
                    info!("Sending {} bytes", data.len());
                    let session = link.service().status().session_id;
                    if let Err(e) = link.service().write(data) {
                        break Err(anyhow!("Write failed: {}", e));
                    }
                    sent_on = Some(session);
                }
            }
            Some(event) = next_hotplug(&hotplug) => link.on_hotplug(event),
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => match parse_command(&line) {
                        Ok(Some(command)) => match execute(&mut link, command) {
                            Ok(true) => {}
                            Ok(false) => break Ok(()),
                            Err(e) => println!("{:#}", e),
                        },
                        Ok(None) => {}
                        Err(e) => println!("{}", e),
                    },
                    Ok(None) => {
                        debug!("stdin closed");
                        break Ok(());
                    }
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
            _ = drain_tick.tick(), if sent_on.is_some() => {
                let status = link.service().status();
                if status.state != LinkState::Connected || Some(status.session_id) != sent_on {
                    break Err(anyhow!("Printing failed: connection lost before the data was written"));
                }
                if status.pending_writes == 0 {
                    info!("All data handed to the printer");
                    break Ok(());
                }
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break Ok(());
            }
        }
    };

    tokio::task::spawn_blocking(move || link.shutdown())
        .await
        .context("Link shutdown panicked")?;
    outcome
}

/// Build a USB link over libusb that follows attach and detach
pub fn usb_link(
    backend: Arc<RusbBackend>,
    filters: Vec<transport::UsbFilter>,
    interface: u8,
    settings: transport::UsbSettings,
) -> Result<UsbLink> {
    let (tx, rx) = async_channel::unbounded();
    let broker = RusbPermissionBroker::new(Arc::clone(&backend), tx.clone());
    let service = LinkService::new(transport::UsbTransport::new(Arc::clone(&backend), settings));
    let supervisor = UsbSupervisor::new(service, broker, filters.clone(), interface);
    let monitor =
        HotplugMonitor::start(backend, filters, tx).context("Failed to start USB hot-plug monitor")?;
    Ok(UsbLink::new(supervisor, monitor, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{DEFAULT_TEST_TIMEOUT, next_event, wait_until};
    use transport::test_utils::{MockBehavior, MockTarget, MockTransport};

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("").unwrap(), None);
        assert_eq!(parse_command("   ").unwrap(), None);
        assert_eq!(
            parse_command("text Hello world").unwrap(),
            Some(ConsoleCommand::Text("Hello world".to_string()))
        );
        assert_eq!(
            parse_command("hex 1b 40").unwrap(),
            Some(ConsoleCommand::Hex(vec![0x1b, 0x40]))
        );
        assert_eq!(
            parse_command("send /tmp/receipt.bin").unwrap(),
            Some(ConsoleCommand::Send(PathBuf::from("/tmp/receipt.bin")))
        );
        assert_eq!(parse_command("STATE").unwrap(), Some(ConsoleCommand::State));
        assert_eq!(parse_command("q").unwrap(), Some(ConsoleCommand::Quit));
        assert_eq!(parse_command("?").unwrap(), Some(ConsoleCommand::Help));
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(parse_command("print").is_err());
        assert!(parse_command("send").is_err());
        assert!(parse_command("hex").is_err());
        assert!(parse_command("hex 1").is_err());
    }

    #[test]
    fn test_parse_hex_forms() {
        assert_eq!(parse_hex("1b40").unwrap(), vec![0x1b, 0x40]);
        assert_eq!(parse_hex("0x1b, 0x40,0a").unwrap(), vec![0x1b, 0x40, 0x0a]);
        assert_eq!(parse_hex("1D 56 00").unwrap(), vec![0x1d, 0x56, 0x00]);
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("abc").is_err());
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(&[]), "");
        assert_eq!(format_hex(&[0x10, 0x04, 0xff]), "10 04 ff");
    }

    #[test]
    fn test_render_event() {
        assert_eq!(render_event(&LinkEvent::Connected), "Connected");
        assert_eq!(
            render_event(&LinkEvent::ConnectedTo("WSP-R240".to_string())),
            "Connected to WSP-R240"
        );
        assert_eq!(
            render_event(&LinkEvent::Received(Bytes::from_static(b"\x12\x00"))),
            "<< 12 00"
        );
        assert!(render_event(&LinkEvent::Failure(FailureReason::ConnectionLost)).contains("lost"));
    }

    #[tokio::test]
    async fn test_execute_writes_to_link() {
        let mut link = DirectLink::new(
            MockTransport::new(),
            MockTarget::new("printer", MockBehavior::Succeed),
        );
        link.connect().unwrap();
        assert_eq!(next_event(&link.service().events()).await, LinkEvent::Connected);

        assert!(execute(&mut link, ConsoleCommand::Text("Hi".to_string())).unwrap());
        assert!(execute(&mut link, ConsoleCommand::Hex(vec![0x1b, 0x40])).unwrap());

        let channel = link.service().transport().last_channel().unwrap();
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || channel.written().len() == 2));
        assert_eq!(channel.written_bytes(), b"Hi\n\x1b@");

        assert!(execute(&mut link, ConsoleCommand::Stop).unwrap());
        assert!(channel.is_closed());
        assert!(!execute(&mut link, ConsoleCommand::Quit).unwrap());
        link.shutdown();
    }

    #[tokio::test]
    async fn test_send_run_drains_and_exits() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("receipt.bin");
        std::fs::write(&path, b"\x1b@Total 12.50\n").unwrap();

        let transport = MockTransport::new();
        let link = DirectLink::new(transport, MockTarget::new("printer", MockBehavior::Succeed));
        let outcome = common::test_utils::with_timeout(DEFAULT_TEST_TIMEOUT, run(link, Some(path)))
            .await
            .expect("send run did not finish");
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_send_run_fails_when_every_write_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("receipt.bin");
        std::fs::write(&path, b"\x1b@Total 12.50\n").unwrap();

        for _ in 0..20 {
            let link = DirectLink::new(
                MockTransport::new(),
                MockTarget::new("printer", MockBehavior::RejectWrites),
            );
            let outcome =
                common::test_utils::with_timeout(DEFAULT_TEST_TIMEOUT, run(link, Some(path.clone())))
                    .await
                    .expect("send run did not finish");
            assert!(outcome.is_err());
        }
    }

    #[tokio::test]
    async fn test_send_run_fails_on_connect_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("receipt.bin");
        std::fs::write(&path, b"x").unwrap();

        let link = DirectLink::new(
            MockTransport::new(),
            MockTarget::new("printer", MockBehavior::Fail(FailureReason::ConnectFailed)),
        );
        let outcome = common::test_utils::with_timeout(DEFAULT_TEST_TIMEOUT, run(link, Some(path)))
            .await
            .expect("send run did not finish");
        assert!(outcome.is_err());
    }
}
