//! Serial Command Channel
//!
//! Owns the single link to the controller and turns the line-oriented serial
//! protocol into request/response exchanges.
//!
//! # Exchange model
//!
//! 1. [`SerialChannel::send`] takes the exchange gate, so at most one command
//!    is on the wire at a time.  Queueing for the gate counts against the
//!    caller's timeout; a command whose deadline passes while queued is never
//!    written.
//! 2. A [`PendingExchange`] is queued with its deadline, then `"<command>\n"`
//!    is written and flushed.
//! 3. The background reader task receives every line.  Each line is published
//!    to [`Topic::Telemetry`]; lines recognised by [`reply::is_reply`] complete
//!    the oldest live pending exchange.
//! 4. If no reply arrives before the deadline the exchange is dropped and the
//!    caller sees [`PollenError::CommandTimeout`].
//!
//! If the transport closes or errors, the link moves to
//! [`LinkState::Faulted`], every pending exchange is cancelled, and a
//! [`Topic::SystemAlerts`] event is published.  Later sends fail with
//! [`PollenError::NotConnected`] until the next [`SerialChannel::connect`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pollen_middleware::{EventBus, Topic};
use pollen_types::{Event, EventPayload, LinkState, PollenError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::reply::{self, READY_BANNER};
use crate::transport::{BoxedTransport, DEFAULT_BAUD_RATE, PortProvider, candidate_ports};

const EVENT_SOURCE: &str = "pollen-hal::channel";

/// Default time to wait for a reply to one command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Longest controller line kept; the rest of an overlong line is dropped.
pub const MAX_LINE_BYTES: usize = 1024;

/// Default time to wait for the boot banner after opening a port.
pub const DEFAULT_READY_GRACE: Duration = Duration::from_millis(2000);

/// Tunables for a [`SerialChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub baud_rate: u32,
    /// Reply deadline used by [`SerialChannel::send_default`].
    pub command_timeout: Duration,
    /// How long [`SerialChannel::connect`] waits for the boot banner.  A
    /// missing banner is tolerated.
    pub ready_grace: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            ready_grace: DEFAULT_READY_GRACE,
        }
    }
}

/// A command waiting for its reply line.
struct PendingExchange {
    id: u64,
    command: String,
    deadline: Instant,
    reply: oneshot::Sender<String>,
}

/// The open half of the link: the writer plus the reader task draining it.
struct Link {
    port: String,
    writer: WriteHalf<BoxedTransport>,
    reader: JoinHandle<()>,
}

/// State shared between the channel and its reader task.
struct Shared {
    state: Mutex<LinkState>,
    port: Mutex<Option<String>>,
    pending: Mutex<VecDeque<PendingExchange>>,
    device_ready: AtomicBool,
    /// Bumped whenever a link is installed or torn down so a stale reader
    /// cannot fault a newer link.
    generation: AtomicU64,
    bus: Option<EventBus>,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        let port = self.port.lock().clone();
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!(?state, port = port.as_deref().unwrap_or("-"), "link state changed");
        let topic = match state {
            LinkState::Faulted => Topic::SystemAlerts,
            _ => Topic::Telemetry,
        };
        self.publish(topic, EventPayload::LinkState { state, port });
    }

    fn publish(&self, topic: Topic, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            bus.publish_to(topic, Event::new(EVENT_SOURCE, payload));
        }
    }

    /// Hand `line` to the oldest pending exchange that is still live.
    fn dispatch(&self, line: &str) {
        if !reply::is_reply(line) {
            return;
        }
        let now = Instant::now();
        let mut pending = self.pending.lock();
        while let Some(exchange) = pending.pop_front() {
            if exchange.deadline < now || exchange.reply.is_closed() {
                debug!(id = exchange.id, command = %exchange.command, "discarding expired exchange");
                continue;
            }
            debug!(id = exchange.id, command = %exchange.command, line, "reply matched");
            let _ = exchange.reply.send(line.to_string());
            return;
        }
        debug!(line, "unsolicited reply discarded");
    }

    fn forget(&self, id: u64) {
        self.pending.lock().retain(|exchange| exchange.id != id);
    }

    /// Drop every pending exchange; their waiters observe a closed link.
    fn cancel_pending(&self) -> usize {
        let mut pending = self.pending.lock();
        let cancelled = pending.len();
        pending.clear();
        cancelled
    }

    fn fault(&self, generation: u64, port: &str, reason: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        warn!(port, reason, "serial link faulted");
        self.device_ready.store(false, Ordering::SeqCst);
        self.set_state(LinkState::Faulted);
        let cancelled = self.cancel_pending();
        if cancelled > 0 {
            warn!(port, cancelled, "cancelled pending exchanges");
        }
        self.publish(
            Topic::SystemAlerts,
            EventPayload::HardwareFault {
                component: format!("serial:{port}"),
                message: reason.to_string(),
            },
        );
    }
}

/// The single serial link to the pollinator controller.
///
/// Wrap it in an [`Arc`] to share it between the device facade and the API;
/// every method takes `&self`.
pub struct SerialChannel {
    shared: Arc<Shared>,
    link: AsyncMutex<Option<Link>>,
    exchange_gate: AsyncMutex<()>,
    provider: Arc<dyn PortProvider>,
    config: ChannelConfig,
    next_exchange_id: AtomicU64,
}

impl SerialChannel {
    pub fn new(config: ChannelConfig, provider: Arc<dyn PortProvider>) -> Self {
        Self::build(config, provider, None)
    }

    /// Like [`new`][Self::new], additionally publishing controller lines and
    /// link changes to `bus`.
    pub fn with_bus(config: ChannelConfig, provider: Arc<dyn PortProvider>, bus: EventBus) -> Self {
        Self::build(config, provider, Some(bus))
    }

    fn build(config: ChannelConfig, provider: Arc<dyn PortProvider>, bus: Option<EventBus>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LinkState::Disconnected),
                port: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                device_ready: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                bus,
            }),
            link: AsyncMutex::new(None),
            exchange_gate: AsyncMutex::new(()),
            provider,
            config,
            next_exchange_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// `true` once the boot banner has been seen on the current link.
    pub fn is_device_ready(&self) -> bool {
        self.shared.device_ready.load(Ordering::SeqCst)
    }

    /// Path of the port the current (or last faulted) link was opened on.
    pub fn port(&self) -> Option<String> {
        self.shared.port.lock().clone()
    }

    /// Open the link.
    ///
    /// With `port_hint`, only that path is tried.  Otherwise the provider's
    /// ports are ordered by [`candidate_ports`] and tried in turn; the first
    /// one that opens and keeps its stream alive through the banner grace
    /// period wins.  An existing link is closed first.
    ///
    /// Returns the path of the connected port.
    ///
    /// # Errors
    ///
    /// - [`PollenError::DeviceNotFound`] – no candidate ports, or none opened.
    /// - [`PollenError::Link`] – the hinted port could not be opened.
    pub async fn connect(&self, port_hint: Option<&str>) -> Result<String, PollenError> {
        let mut link = self.link.lock().await;
        if let Some(old) = link.take() {
            info!(port = %old.port, "closing existing link before reconnect");
            self.close_link(old).await;
        }
        self.shared.set_state(LinkState::Connecting);

        let candidates = match port_hint {
            Some(path) => vec![path.to_string()],
            None => match self.provider.list_ports() {
                Ok(ports) => candidate_ports(&ports),
                Err(e) => {
                    self.shared.set_state(LinkState::Disconnected);
                    return Err(e);
                }
            },
        };
        if candidates.is_empty() {
            self.shared.set_state(LinkState::Disconnected);
            return Err(PollenError::DeviceNotFound(
                "no controller or USB serial ports present".into(),
            ));
        }

        let mut last_error = None;
        for path in &candidates {
            let transport = match self.provider.open(path, self.config.baud_rate) {
                Ok(transport) => transport,
                Err(e) => {
                    debug!(port = %path, error = %e, "candidate port did not open");
                    last_error = Some(e);
                    continue;
                }
            };

            let (banner_tx, banner_rx) = oneshot::channel();
            let opened = self.install(transport, path, banner_tx);
            let generation = self.shared.generation.load(Ordering::SeqCst);
            *link = Some(opened);

            match tokio::time::timeout(self.config.ready_grace, banner_rx).await {
                Ok(Ok(())) => info!(port = %path, "controller reported ready"),
                Err(_) => warn!(
                    port = %path,
                    grace_ms = self.config.ready_grace.as_millis() as u64,
                    "no ready banner; assuming the controller is up"
                ),
                Ok(Err(_)) => {
                    warn!(port = %path, "port closed during ready wait");
                    if let Some(dead) = link.take() {
                        self.close_link(dead).await;
                    }
                    last_error = Some(PollenError::Link(format!("{path} closed during ready wait")));
                    continue;
                }
            }

            let promoted = {
                let mut state = self.shared.state.lock();
                let current_link = self.shared.generation.load(Ordering::SeqCst) == generation;
                if *state == LinkState::Connecting && current_link {
                    *state = LinkState::Connected;
                    true
                } else {
                    false
                }
            };
            if !promoted {
                if let Some(dead) = link.take() {
                    self.close_link(dead).await;
                }
                last_error = Some(PollenError::Link(format!("{path} faulted while connecting")));
                continue;
            }
            info!(port = %path, "serial link connected");
            self.shared.publish(
                Topic::Telemetry,
                EventPayload::LinkState {
                    state: LinkState::Connected,
                    port: Some(path.clone()),
                },
            );
            return Ok(path.clone());
        }

        self.shared.set_state(LinkState::Disconnected);
        Err(match (port_hint, last_error) {
            (Some(_), Some(e)) => e,
            (_, Some(e)) => PollenError::DeviceNotFound(format!(
                "none of {} candidate ports accepted a connection (last: {e})",
                candidates.len()
            )),
            (_, None) => PollenError::DeviceNotFound("no candidate port opened".into()),
        })
    }

    /// Split `transport`, spawn its reader task and record the port.
    fn install(&self, transport: BoxedTransport, path: &str, banner: oneshot::Sender<()>) -> Link {
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.port.lock() = Some(path.to_string());
        self.shared.device_ready.store(false, Ordering::SeqCst);
        // A fault from an earlier generation may have left us Faulted.
        *self.shared.state.lock() = LinkState::Connecting;

        let (reader, writer) = tokio::io::split(transport);
        let task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.shared),
            generation,
            path.to_string(),
            banner,
        ));
        Link {
            port: path.to_string(),
            writer,
            reader: task,
        }
    }

    async fn close_link(&self, mut link: Link) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        link.reader.abort();
        if let Err(e) = link.writer.shutdown().await {
            debug!(port = %link.port, error = %e, "writer shutdown failed");
        }
        self.shared.cancel_pending();
        self.shared.device_ready.store(false, Ordering::SeqCst);
    }

    /// Close the link if open.  Idempotent; pending exchanges are cancelled
    /// and their callers receive [`PollenError::Link`].
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        if let Some(open) = link.take() {
            info!(port = %open.port, "disconnecting serial link");
            self.close_link(open).await;
        }
        self.shared.set_state(LinkState::Disconnected);
    }

    /// Send `command` and wait up to `timeout` for its reply line.
    ///
    /// # Errors
    ///
    /// - [`PollenError::NotConnected`] – the link is not in
    ///   [`LinkState::Connected`].
    /// - [`PollenError::CommandTimeout`] – no recognised reply in time.
    /// - [`PollenError::Link`] – the write failed or the link went down while
    ///   waiting.
    pub async fn send(&self, command: &str, timeout: Duration) -> Result<String, PollenError> {
        if !self.is_connected() {
            return Err(PollenError::NotConnected);
        }
        // Time spent queued behind other exchanges counts against `timeout`.
        let deadline = Instant::now() + timeout;
        let Ok(_turn) = tokio::time::timeout_at(deadline, self.exchange_gate.lock()).await else {
            warn!(command, "controller command expired while queued");
            return Err(command_timeout(command, timeout));
        };
        // The gate can be released at the very instant the deadline passes.
        if Instant::now() >= deadline {
            warn!(command, "controller command expired while queued");
            return Err(command_timeout(command, timeout));
        }
        if !self.is_connected() {
            return Err(PollenError::NotConnected);
        }

        let id = self.next_exchange_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().push_back(PendingExchange {
            id,
            command: command.to_string(),
            deadline,
            reply: tx,
        });
        debug!(id, command, "sending controller command");

        let exchange = async {
            self.write_line(command).await?;
            rx.await.map_err(|_| {
                PollenError::Link(format!("link closed while awaiting reply to '{command}'"))
            })
        };
        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(line)) => Ok(line),
            Ok(Err(e)) => {
                self.shared.forget(id);
                Err(e)
            }
            Err(_) => {
                self.shared.forget(id);
                warn!(id, command, timeout_ms = timeout.as_millis() as u64, "controller command timed out");
                Err(command_timeout(command, timeout))
            }
        }
    }

    /// [`send`][Self::send] with the configured command timeout.
    pub async fn send_default(&self, command: &str) -> Result<String, PollenError> {
        self.send(command, self.config.command_timeout).await
    }

    async fn write_line(&self, command: &str) -> Result<(), PollenError> {
        let mut link = self.link.lock().await;
        let open = link.as_mut().ok_or(PollenError::NotConnected)?;
        let mut frame = String::with_capacity(command.len() + 1);
        frame.push_str(command);
        frame.push('\n');
        open.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| PollenError::Link(format!("write of '{command}' failed: {e}")))?;
        open.writer
            .flush()
            .await
            .map_err(|e| PollenError::Link(format!("flush after '{command}' failed: {e}")))
    }
}

fn command_timeout(command: &str, timeout: Duration) -> PollenError {
    PollenError::CommandTimeout {
        command: command.to_string(),
        timeout_ms: timeout.as_millis() as u64,
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
        }
    }
}

/// Drain controller lines until the transport closes.
async fn read_loop(
    reader: ReadHalf<BoxedTransport>,
    shared: Arc<Shared>,
    generation: u64,
    port: String,
    banner: oneshot::Sender<()>,
) {
    let mut banner = Some(banner);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(128);
    // Set while skipping the tail of an overlong line.
    let mut discarding = false;
    let reason = loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break "port closed".to_string(),
            Ok(_) => {
                let complete = buf.last() == Some(&b'\n');
                if discarding {
                    discarding = !complete;
                    continue;
                }
                if !complete && buf.len() >= MAX_LINE_BYTES {
                    warn!(port = %port, limit = MAX_LINE_BYTES, "dropping overlong controller line");
                    discarding = true;
                    continue;
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                debug!(port = %port, line, "controller line");
                if line.contains(READY_BANNER) {
                    shared.device_ready.store(true, Ordering::SeqCst);
                    if let Some(tx) = banner.take() {
                        let _ = tx.send(());
                    }
                }
                shared.publish(Topic::Telemetry, EventPayload::DeviceLine(line.to_string()));
                shared.dispatch(line);
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };
    shared.fault(generation, &port, &reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SIM_PORT, SimController, SimPorts};
    use crate::transport::PortInfo;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Provider whose ports are in-memory pipes the test drives by hand.
    struct LoopbackPorts {
        ports: Vec<PortInfo>,
        openable: Vec<String>,
        device_ends: Mutex<Vec<(String, DuplexStream)>>,
    }

    impl LoopbackPorts {
        fn new(ports: Vec<PortInfo>, openable: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ports,
                openable: openable.iter().map(|p| p.to_string()).collect(),
                device_ends: Mutex::new(Vec::new()),
            })
        }

        fn take_device(&self, path: &str) -> DuplexStream {
            let mut ends = self.device_ends.lock();
            let at = ends
                .iter()
                .position(|(p, _)| p == path)
                .expect("port was never opened");
            ends.remove(at).1
        }
    }

    impl PortProvider for LoopbackPorts {
        fn list_ports(&self) -> Result<Vec<PortInfo>, PollenError> {
            Ok(self.ports.clone())
        }

        fn open(&self, path: &str, _baud_rate: u32) -> Result<BoxedTransport, PollenError> {
            if !self.openable.iter().any(|p| p == path) {
                return Err(PollenError::Link(format!("permission denied: {path}")));
            }
            let (host, device) = tokio::io::duplex(1024);
            self.device_ends.lock().push((path.to_string(), device));
            Ok(Box::new(host))
        }
    }

    fn quick_config() -> ChannelConfig {
        ChannelConfig {
            ready_grace: Duration::from_millis(50),
            ..ChannelConfig::default()
        }
    }

    async fn connected_sim(controller: &SimController) -> SerialChannel {
        let channel = SerialChannel::new(quick_config(), Arc::new(SimPorts::new(controller.clone())));
        channel.connect(None).await.expect("sim connects");
        channel
    }

    #[tokio::test]
    async fn send_while_disconnected_fails_fast() {
        let channel = SerialChannel::new(ChannelConfig::default(), Arc::new(SimPorts::default()));
        let err = channel.send("HOME", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, PollenError::NotConnected);
        assert_eq!(channel.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn connect_sees_banner_and_exchanges_commands() {
        let controller = SimController::new().with_distance(18);
        let channel = connected_sim(&controller).await;

        assert_eq!(channel.state(), LinkState::Connected);
        assert!(channel.is_device_ready());
        assert_eq!(channel.port().as_deref(), Some(SIM_PORT));

        let reply = channel.send_default("STATUS").await.unwrap();
        assert!(reply.starts_with("STATUS"));
        assert!(reply.contains("DIST:18"));
        assert_eq!(controller.commands(), vec!["STATUS"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_times_out_after_deadline() {
        let controller = SimController::new().silent();
        let channel = connected_sim(&controller).await;

        let started = Instant::now();
        let err = channel.send("POLL", DEFAULT_COMMAND_TIMEOUT).await.unwrap_err();
        assert_eq!(
            err,
            PollenError::CommandTimeout {
                command: "POLL".into(),
                timeout_ms: 5000
            }
        );
        assert!(started.elapsed() >= DEFAULT_COMMAND_TIMEOUT);
        // The link survives a timeout.
        assert!(channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn queued_sends_expire_on_their_own_deadline() {
        let controller = SimController::new().silent();
        let channel = Arc::new(connected_sim(&controller).await);

        let started = Instant::now();
        let sends: Vec<_> = (0..3)
            .map(|_| {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move {
                    let result = channel.send("POLL", DEFAULT_COMMAND_TIMEOUT).await;
                    (result, started.elapsed())
                })
            })
            .collect();

        for send in sends {
            let (result, elapsed) = send.await.unwrap();
            assert!(matches!(result, Err(PollenError::CommandTimeout { .. })));
            assert!(elapsed >= DEFAULT_COMMAND_TIMEOUT);
            assert!(
                elapsed < DEFAULT_COMMAND_TIMEOUT + Duration::from_millis(100),
                "send overran its timeout: {elapsed:?}"
            );
        }
        // Commands that expired in the queue never reach the wire.
        assert_eq!(controller.commands(), vec!["POLL"]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_banner_is_tolerated() {
        let controller = SimController::new().without_banner();
        let channel = SerialChannel::new(
            ChannelConfig::default(),
            Arc::new(SimPorts::new(controller.clone())),
        );

        let started = Instant::now();
        channel.connect(None).await.unwrap();
        assert!(started.elapsed() >= DEFAULT_READY_GRACE);
        assert!(channel.is_connected());
        assert!(!channel.is_device_ready());

        assert_eq!(channel.send_default("HOME").await.unwrap(), "HOMED");
    }

    #[tokio::test]
    async fn discovery_skips_ports_that_fail_to_open() {
        let provider = LoopbackPorts::new(
            vec![
                PortInfo::new("/dev/ttyS0"),
                PortInfo {
                    path: "/dev/ttyACM0".into(),
                    manufacturer: Some("Arduino LLC".into()),
                    vendor_id: Some(0x2341),
                },
                PortInfo::new("/dev/ttyUSB0"),
            ],
            &["/dev/ttyUSB0"],
        );
        let channel = SerialChannel::new(quick_config(), provider.clone());

        let port = channel.connect(None).await.unwrap();
        assert_eq!(port, "/dev/ttyUSB0");
        assert!(channel.is_connected());
        let _device = provider.take_device("/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn no_candidates_is_device_not_found() {
        let provider = LoopbackPorts::new(vec![PortInfo::new("/dev/ttyS0")], &[]);
        let channel = SerialChannel::new(quick_config(), provider);

        let err = channel.connect(None).await.unwrap_err();
        assert!(matches!(err, PollenError::DeviceNotFound(_)));
        assert_eq!(channel.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn hinted_port_open_failure_is_reported() {
        let provider = LoopbackPorts::new(vec![], &[]);
        let channel = SerialChannel::new(quick_config(), provider);

        let err = channel.connect(Some("/dev/ttyACM9")).await.unwrap_err();
        assert!(matches!(err, PollenError::Link(msg) if msg.contains("/dev/ttyACM9")));
    }

    #[tokio::test]
    async fn chatter_is_published_but_does_not_complete_exchange() {
        let provider = LoopbackPorts::new(vec![], &["/dev/ttyACM0"]);
        let bus = EventBus::default();
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);
        let channel = Arc::new(SerialChannel::with_bus(quick_config(), provider.clone(), bus));
        channel.connect(Some("/dev/ttyACM0")).await.unwrap();

        let device = provider.take_device("/dev/ttyACM0");
        let (device_rx, mut device_tx) = tokio::io::split(device);
        let mut device_rx = BufReader::new(device_rx).lines();

        let sender = Arc::clone(&channel);
        let exchange = tokio::spawn(async move { sender.send("HOME", Duration::from_secs(2)).await });

        assert_eq!(device_rx.next_line().await.unwrap().as_deref(), Some("HOME"));
        device_tx.write_all(b"servo warm\r\nHOMED\r\n").await.unwrap();

        assert_eq!(exchange.await.unwrap().unwrap(), "HOMED");

        let mut lines = Vec::new();
        while let Ok(event) = telemetry.try_recv() {
            if let EventPayload::DeviceLine(line) = event.payload {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["servo warm", "HOMED"]);
    }

    #[tokio::test]
    async fn overlong_line_is_dropped_without_losing_the_next_reply() {
        let provider = LoopbackPorts::new(vec![], &["/dev/ttyACM0"]);
        let bus = EventBus::default();
        let mut telemetry = bus.subscribe_to(Topic::Telemetry);
        let channel = Arc::new(SerialChannel::with_bus(quick_config(), provider.clone(), bus));
        channel.connect(Some("/dev/ttyACM0")).await.unwrap();

        let device = provider.take_device("/dev/ttyACM0");
        let (device_rx, mut device_tx) = tokio::io::split(device);
        let mut device_rx = BufReader::new(device_rx).lines();

        let sender = Arc::clone(&channel);
        let exchange = tokio::spawn(async move { sender.send("HOME", Duration::from_secs(2)).await });
        assert_eq!(device_rx.next_line().await.unwrap().as_deref(), Some("HOME"));

        // The tail of the runaway line would otherwise read as a DIST reply.
        device_tx.write_all(&vec![b'x'; MAX_LINE_BYTES * 3]).await.unwrap();
        device_tx.write_all(b"DIST:12 tail\nHOMED\n").await.unwrap();

        assert_eq!(exchange.await.unwrap().unwrap(), "HOMED");
        assert!(channel.is_connected());

        let mut lines = Vec::new();
        while let Ok(event) = telemetry.try_recv() {
            if let EventPayload::DeviceLine(line) = event.payload {
                lines.push(line);
            }
        }
        assert_eq!(lines, vec!["HOMED"]);
    }

    #[tokio::test]
    async fn concurrent_sends_are_serialized() {
        let provider = LoopbackPorts::new(vec![], &["/dev/ttyACM0"]);
        let channel = Arc::new(SerialChannel::new(quick_config(), provider.clone()));
        channel.connect(Some("/dev/ttyACM0")).await.unwrap();

        let device = provider.take_device("/dev/ttyACM0");
        let (device_rx, mut device_tx) = tokio::io::split(device);
        let mut device_rx = BufReader::new(device_rx).lines();

        let a = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send("HOME", Duration::from_secs(2)).await })
        };
        let b = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.send("TEST", Duration::from_secs(2)).await })
        };

        // Each command reaches the wire only after the previous reply.
        for _ in 0..2 {
            let command = device_rx.next_line().await.unwrap().unwrap();
            let reply = if command == "HOME" { "HOMED\n" } else { "TEST_DONE\n" };
            device_tx.write_all(reply.as_bytes()).await.unwrap();
        }

        assert_eq!(a.await.unwrap().unwrap(), "HOMED");
        assert_eq!(b.await.unwrap().unwrap(), "TEST_DONE");
    }

    #[tokio::test]
    async fn transport_close_faults_link_and_cancels_pending() {
        let provider = LoopbackPorts::new(vec![], &["/dev/ttyACM0"]);
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let channel = Arc::new(SerialChannel::with_bus(quick_config(), provider.clone(), bus));
        channel.connect(Some("/dev/ttyACM0")).await.unwrap();

        let device = provider.take_device("/dev/ttyACM0");
        let (device_rx, device_tx) = tokio::io::split(device);
        let mut device_rx = BufReader::new(device_rx).lines();

        let sender = Arc::clone(&channel);
        let exchange = tokio::spawn(async move { sender.send("POLL", Duration::from_secs(5)).await });
        assert_eq!(device_rx.next_line().await.unwrap().as_deref(), Some("POLL"));

        drop(device_tx);
        drop(device_rx);

        let err = exchange.await.unwrap().unwrap_err();
        assert!(matches!(err, PollenError::Link(_)));
        assert_eq!(channel.state(), LinkState::Faulted);
        assert_eq!(
            channel.send_default("HOME").await.unwrap_err(),
            PollenError::NotConnected
        );

        let alert = alerts.recv().await.unwrap();
        assert!(matches!(
            alert.payload,
            EventPayload::LinkState {
                state: LinkState::Faulted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn disconnect_cancels_in_flight_exchange() {
        let controller = SimController::new().silent();
        let channel = Arc::new(connected_sim(&controller).await);

        let sender = Arc::clone(&channel);
        let exchange = tokio::spawn(async move { sender.send("POLL", Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.disconnect().await;
        let err = exchange.await.unwrap().unwrap_err();
        assert!(matches!(err, PollenError::Link(_)));
        assert_eq!(channel.state(), LinkState::Disconnected);

        // Idempotent.
        channel.disconnect().await;
        assert_eq!(channel.state(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn reconnect_replaces_existing_link() {
        let controller = SimController::new();
        let channel = connected_sim(&controller).await;
        channel.connect(None).await.unwrap();

        assert!(channel.is_connected());
        assert_eq!(channel.send_default("HOME").await.unwrap(), "HOMED");
    }
}
