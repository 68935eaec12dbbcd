//! Receiver connection session.
//!
//! A [`ConnectionSession`] owns one background worker that connects, performs
//! the handshake, sends the startup requests and then multiplexes outgoing
//! commands, inbound payloads and the latency probe over a single socket.
//! Callers only ever talk to the worker through the [`CommandQueue`] and the
//! event channel; state changes are also published on a [`watch`] channel so
//! any number of consumers can react without polling.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::command::{Command, request_body};
use crate::demux::{DemuxConfig, ReceiveBuffer, StreamDemultiplexer};
use crate::diagnostics::{LatencyProbe, LatencySample, LatencyStats, ProbeConfig};
use crate::framing::{FrameError, write_frame};
use crate::handshake::{ClientIdentity, handshake_body, startup_bodies};
use crate::payload::DecodedPayload;
use crate::platform::{SocketConfig, configure_stream};
use crate::queue::CommandQueue;
use crate::reconnection::{ReconnectConfig, ReconnectPolicy};

/// TCP port the receiver's remote-control service listens on.
pub const DEFAULT_DEVICE_PORT: u16 = 20000;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No worker is running.
    Disconnected,
    /// Attempting to establish a TCP connection.
    Connecting,
    /// TCP connected, sending the handshake.
    Handshaking,
    /// Sending the startup requests.
    Initializing,
    /// Ready for commands.
    Connected,
    /// Connection lost, waiting before the next attempt.
    Reconnecting,
    /// Reconnection attempts exhausted. Requires [`ConnectionSession::start`].
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    pub fn set(&self, state: ConnectionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Notifications emitted by the session worker, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection moved to a new state.
    State {
        /// The new state.
        state: ConnectionState,
        /// Consecutive failed attempts so far (0 once connected).
        attempt: u32,
    },
    /// A payload was decoded from the receive stream.
    Payload(DecodedPayload),
    /// A latency probe completed.
    Latency {
        /// This probe's outcome.
        sample: LatencySample,
        /// The rolling window after recording it.
        stats: LatencyStats,
    },
    /// The socket was closed because of an error.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
}

/// Receiving end of a session's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Errors surfaced by the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Commands are only accepted while connected.
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),
    /// The TCP connect did not complete in time.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Target address.
        addr: String,
        /// Configured timeout.
        timeout: Duration,
    },
    /// The receiver closed the connection.
    #[error("connection closed by peer")]
    PeerClosed,
    /// Too many latency probes went unanswered.
    #[error("{0} consecutive probes unanswered")]
    Unresponsive(u32),
    /// A frame could not be written.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a session needs to reach and talk to one receiver.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Receiver host name or IP address.
    pub host: String,
    /// Receiver port. Default: 20000.
    pub port: u16,
    /// Identity presented in the handshake.
    pub identity: ClientIdentity,
    /// Bound on each TCP connect. Default: 10 s.
    pub connect_timeout: Duration,
    /// Pause between startup requests. Default: 100 ms.
    pub startup_delay: Duration,
    /// Size of a single socket read. Default: 64 KiB.
    pub read_chunk_size: usize,
    /// Demultiplexer limits.
    pub demux: DemuxConfig,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
    /// Latency probe.
    pub probe: ProbeConfig,
    /// Socket options.
    pub socket: SocketConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_DEVICE_PORT,
            identity: ClientIdentity::default(),
            connect_timeout: Duration::from_secs(10),
            startup_delay: Duration::from_millis(100),
            read_chunk_size: 64 * 1024,
            demux: DemuxConfig::default(),
            reconnect: ReconnectConfig::default(),
            probe: ProbeConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Default settings for the receiver at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// `host:port` as passed to the resolver.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Handle to a receiver connection.
///
/// Created via [`ConnectionSession::new`]; nothing happens until
/// [`ConnectionSession::start`] is called from within a tokio runtime.
pub struct ConnectionSession {
    config: Arc<SessionConfig>,
    queue: Arc<CommandQueue>,
    state: Arc<ConnectionStateWatch>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Sending `true` causes the worker to exit.
    shutdown_tx: Option<watch::Sender<bool>>,
    worker: Option<JoinHandle<()>>,
}

impl ConnectionSession {
    /// Create a session and the receiver for its events.
    pub fn new(config: SessionConfig) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let session = Self {
            config: Arc::new(config),
            queue: Arc::new(CommandQueue::new()),
            state: Arc::new(ConnectionStateWatch::new()),
            events,
            shutdown_tx: None,
            worker: None,
        };
        (session, rx)
    }

    /// Spawn the connection worker.
    ///
    /// Starting resets the reconnection attempt counter. Returns `false` if a
    /// worker is already running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            Arc::clone(&self.config),
            Arc::clone(&self.queue),
            Arc::clone(&self.state),
            self.events.clone(),
            shutdown_rx,
        );

        tracing::info!(addr = %self.config.address(), "starting session");
        self.shutdown_tx = Some(shutdown_tx);
        self.worker = Some(tokio::spawn(worker.run()));
        true
    }

    /// Queue a command for the receiver.
    ///
    /// Accepted commands belong to the current connection; if it drops before
    /// they are written they are discarded, never replayed on the next one.
    pub fn submit(&self, cmd: impl Into<Command>) -> Result<(), SessionError> {
        self.queue
            .try_enqueue(cmd.into())
            .map_err(|_| SessionError::NotConnected(self.state.current()))
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// Pending commands are dropped and no further events are emitted.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        let dropped = self.queue.close();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped pending commands on stop");
        }
        self.state.set(ConnectionState::Disconnected);
        tracing::info!("session stopped");
    }

    /// Return the current state without blocking.
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Whether a worker task is still alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The session's configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// The background task; sole owner of the socket, buffer and state.
struct Worker {
    config: Arc<SessionConfig>,
    queue: Arc<CommandQueue>,
    state: Arc<ConnectionStateWatch>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    policy: ReconnectPolicy,
    probe: LatencyProbe,
}

impl Worker {
    fn new(
        config: Arc<SessionConfig>,
        queue: Arc<CommandQueue>,
        state: Arc<ConnectionStateWatch>,
        events: mpsc::UnboundedSender<SessionEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            probe: LatencyProbe::new(config.probe.clone()),
            config,
            queue,
            state,
            events,
            shutdown,
        }
    }

    async fn run(mut self) {
        let mut failures = 0u32;

        while !self.stopping() {
            self.transition(ConnectionState::Connecting, failures);

            let err = match self.connect_and_serve(&mut failures).await {
                Ok(()) => break,
                Err(e) => e,
            };
            if self.stopping() {
                break;
            }

            self.handle_connection_error(&err);
            failures += 1;
            self.transition(ConnectionState::Reconnecting, failures);

            let max_attempts = self.policy.max_attempts();
            let delay = match self.policy.should_retry(failures) {
                Some(delay) if failures < max_attempts => delay,
                _ => {
                    tracing::warn!("giving up after {failures} failed attempts");
                    self.transition(ConnectionState::Failed, failures);
                    return;
                }
            };

            tracing::info!("reconnection attempt {}/{max_attempts} in {delay:?}", failures + 1);
            if !self.sleep_unless_stopped(delay).await {
                break;
            }
        }

        self.queue.close();
        self.state.set(ConnectionState::Disconnected);
    }

    /// Connect, handshake and initialise, then serve until error or stop.
    ///
    /// `Ok(())` means a stop was requested.
    async fn connect_and_serve(&mut self, failures: &mut u32) -> Result<(), SessionError> {
        let config = Arc::clone(&self.config);
        let addr = config.address();

        let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr));
        let stream = tokio::select! {
            () = stop_requested(&mut self.shutdown) => return Ok(()),
            result = connect => result.map_err(|_| SessionError::ConnectTimeout {
                addr: addr.clone(),
                timeout: config.connect_timeout,
            })??,
        };
        configure_stream(&stream, &config.socket)?;
        tracing::debug!(%addr, "TCP connected");

        let (reader, mut writer) = stream.into_split();

        self.transition(ConnectionState::Handshaking, *failures);
        write_frame(&mut writer, &handshake_body(&config.identity)).await?;

        self.transition(ConnectionState::Initializing, *failures);
        for (i, body) in startup_bodies().iter().enumerate() {
            if i > 0 && !self.sleep_unless_stopped(config.startup_delay).await {
                return Ok(());
            }
            write_frame(&mut writer, body).await?;
        }

        *failures = 0;
        self.probe.reset();
        let stale = self.queue.open();
        if stale > 0 {
            tracing::debug!(stale, "dropped commands left from a previous connection");
        }
        self.transition(ConnectionState::Connected, 0);

        self.serve(reader, writer).await
    }

    /// The connected loop: commands out, payloads in, probe on a timer.
    async fn serve(
        &mut self,
        mut reader: OwnedReadHalf,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), SessionError> {
        let mut buf = ReceiveBuffer::new();
        let mut demux = StreamDemultiplexer::new(self.config.demux.clone());
        let mut chunk = vec![0u8; self.config.read_chunk_size.max(1)];

        let probe_enabled = self.config.probe.enabled;
        let interval = self.config.probe.interval.max(Duration::from_millis(1));
        let mut probe_tick = tokio::time::interval_at(Instant::now() + interval, interval);
        probe_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.probe.deadline();
            let probe_due = probe_enabled && !self.probe.is_pending();

            tokio::select! {
                () = stop_requested(&mut self.shutdown) => return Ok(()),

                () = self.queue.wait_ready() => {
                    self.flush_queue(&mut writer, &mut demux).await?;
                }

                read = reader.read(&mut chunk) => {
                    let n = read?;
                    if n == 0 {
                        return Err(SessionError::PeerClosed);
                    }
                    tracing::trace!(bytes = n, buffered = buf.len(), "received");

                    if let Some(sample) = self.probe.on_response() {
                        tracing::debug!(%sample, "probe answered");
                        self.emit_latency(sample);
                    }

                    buf.extend(&chunk[..n]);
                    for payload in demux.drain(&mut buf) {
                        tracing::info!("received {payload}");
                        self.emit(SessionEvent::Payload(payload));
                    }
                }

                _ = probe_tick.tick(), if probe_due => {
                    self.send_probe(&mut writer).await?;
                }

                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(sample) = self.probe.on_timeout() {
                        tracing::debug!(%sample, "probe timed out");
                        self.emit_latency(sample);
                    }
                    if self.probe.is_unresponsive() {
                        return Err(SessionError::Unresponsive(self.probe.consecutive_missed()));
                    }
                }
            }
        }
    }

    /// Write every queued command, arming channel-list detection first.
    async fn flush_queue(
        &self,
        writer: &mut OwnedWriteHalf,
        demux: &mut StreamDemultiplexer,
    ) -> Result<(), SessionError> {
        let batch = self.queue.dequeue_all_ready();
        if batch.is_empty() {
            return Ok(());
        }
        if batch.expects_channel_list {
            demux.expect_channel_list();
        }
        for body in &batch.payloads {
            write_frame(writer, body).await?;
        }
        tracing::debug!(count = batch.payloads.len(), "commands sent");
        Ok(())
    }

    /// Write one probe; a failed write is reported and ends the connection.
    async fn send_probe<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<(), SessionError> {
        let body = request_body(&self.probe.config().request_code, serde_json::Map::new());
        match write_frame(writer, &body).await {
            Ok(()) => {
                self.probe.on_sent();
                Ok(())
            }
            Err(e) => {
                let sample = self.probe.on_send_failed();
                tracing::debug!(%sample, "probe not sent");
                self.emit_latency(sample);
                Err(e.into())
            }
        }
    }

    /// Tear down per-connection state after a failure.
    fn handle_connection_error(&mut self, err: &SessionError) {
        tracing::warn!("connection error: {err}");
        self.probe.reset();
        let dropped = self.queue.close();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped pending commands");
        }
        self.emit(SessionEvent::Disconnected {
            reason: err.to_string(),
        });
    }

    fn transition(&self, state: ConnectionState, attempt: u32) {
        tracing::info!(%state, attempt, "connection state changed");
        self.state.set(state);
        self.emit(SessionEvent::State { state, attempt });
    }

    fn emit_latency(&self, sample: LatencySample) {
        self.emit(SessionEvent::Latency {
            sample,
            stats: self.probe.stats(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        // A dropped receiver only means nobody is listening.
        let _ = self.events.send(event);
    }

    /// Whether a stop was requested or the session handle is gone.
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep for `delay`; returns `false` if a stop arrived first.
    async fn sleep_unless_stopped(&mut self, delay: Duration) -> bool {
        tokio::select! {
            () = stop_requested(&mut self.shutdown) => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Resolves once `true` is sent or the sender is dropped.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandTag, Request};
    use crate::framing::read_frame;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

    fn test_config(addr: SocketAddr) -> SessionConfig {
        SessionConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            connect_timeout: Duration::from_secs(1),
            startup_delay: Duration::from_millis(1),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 5,
            },
            probe: ProbeConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Accept one client and consume the handshake plus startup frames.
    async fn accept_client(listener: &TcpListener) -> (TcpStream, Vec<Vec<u8>>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut frames = Vec::new();
        for _ in 0..1 + startup_bodies().len() {
            frames.push(read_frame(&mut stream).await.unwrap());
        }
        (stream, frames)
    }

    async fn next_event(events: &mut EventReceiver) -> SessionEvent {
        tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Collect events up to and including the given state.
    async fn events_until(events: &mut EventReceiver, target: ConnectionState) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(events).await;
            let done = matches!(event, SessionEvent::State { state, .. } if state == target);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn states(events: &[SessionEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::State { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Wait for the worker task to exit after a terminal state.
    async fn worker_exit(session: &ConnectionSession) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while session.is_running() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("worker did not exit");
    }

    async fn next_payload(events: &mut EventReceiver) -> DecodedPayload {
        loop {
            if let SessionEvent::Payload(payload) = next_event(events).await {
                return payload;
            }
        }
    }

    #[tokio::test]
    async fn test_handshake_then_startup_requests() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        let mut state_rx = session.subscribe_state();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
        assert!(session.start());

        let (_stream, frames) = accept_client(&listener).await;
        assert_eq!(frames[0], handshake_body(&ClientIdentity::default()));
        assert_eq!(frames[1..], startup_bodies()[..]);

        let reached = tokio::time::timeout(
            EVENT_TIMEOUT,
            state_rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await
        .expect("never connected")
        .is_ok();
        assert!(reached);

        let seen = events_until(&mut events, ConnectionState::Connected).await;
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Handshaking,
                ConnectionState::Initializing,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(session.state(), ConnectionState::Connected);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_payloads_from_separate_reads_arrive_in_order() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        session.start();

        let (mut stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        stream.write_all(b"Start0000004Endabcd").await.unwrap();
        stream.flush().await.unwrap();
        assert_eq!(next_payload(&mut events).await, DecodedPayload::RawText("abcd".into()));

        stream.write_all(b"Start0000004End").await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b"wxyz").await.unwrap();
        assert_eq!(next_payload(&mut events).await, DecodedPayload::RawText("wxyz".into()));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_commands_are_framed_in_order() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        session.start();

        let (mut stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        session.submit(Request::SendKey { key: 1 }).unwrap();
        session.submit(Request::ChangeChannel { program_id: "5".into() }).unwrap();
        session.submit(Command::new("raw")).unwrap();

        assert_eq!(read_frame(&mut stream).await.unwrap(), br#"{"request":"1040","KeyValue":"1"}"#);
        assert_eq!(read_frame(&mut stream).await.unwrap(), br#"{"request":"1009","ProgramId":"5"}"#);
        assert_eq!(read_frame(&mut stream).await.unwrap(), b"raw");

        session.stop().await;
    }

    #[tokio::test]
    async fn test_empty_array_after_channel_request_is_channel_list() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        session.start();

        let (mut stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        stream.write_all(b"[]").await.unwrap();
        assert_eq!(
            next_payload(&mut events).await,
            DecodedPayload::GenericJson(serde_json::json!([]))
        );

        let request = Command::from(Request::FetchChannels { from: 0, to: 10 });
        assert_eq!(request.tag(), CommandTag::ChannelListRequest);
        session.submit(request).unwrap();
        let sent = read_frame(&mut stream).await.unwrap();
        assert!(sent.starts_with(br#"{"request":"0""#));

        stream.write_all(b"[]").await.unwrap();
        assert_eq!(next_payload(&mut events).await, DecodedPayload::ChannelList(Vec::new()));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_submit_rejected_while_not_connected() {
        let (_listener, addr) = listener().await;
        let (session, _events) = ConnectionSession::new(test_config(addr));
        let result = session.submit(Command::new("x"));
        assert!(matches!(
            result,
            Err(SessionError::NotConnected(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_and_restart_resets_counter() {
        let (listener, addr) = listener().await;
        drop(listener);

        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        for _ in 0..2 {
            assert!(session.start());
            let seen = events_until(&mut events, ConnectionState::Failed).await;

            let reconnecting = states(&seen)
                .into_iter()
                .filter(|s| *s == ConnectionState::Reconnecting)
                .count();
            let disconnects = seen
                .iter()
                .filter(|e| matches!(e, SessionEvent::Disconnected { .. }))
                .count();
            let connecting = states(&seen)
                .into_iter()
                .filter(|s| *s == ConnectionState::Connecting)
                .count();
            assert_eq!(disconnects, 5);
            assert_eq!(connecting, 5);
            assert_eq!(reconnecting, 5);

            // The last failure goes through Reconnecting before giving up.
            let tail: Vec<&SessionEvent> = seen.iter().rev().take(2).rev().collect();
            assert_eq!(
                tail,
                [
                    &SessionEvent::State {
                        state: ConnectionState::Reconnecting,
                        attempt: 5
                    },
                    &SessionEvent::State {
                        state: ConnectionState::Failed,
                        attempt: 5
                    },
                ]
            );
            assert_eq!(session.state(), ConnectionState::Failed);

            worker_exit(&session).await;
            assert!(events.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_peer_close_triggers_reconnect() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        session.start();

        let (stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;
        drop(stream);

        let device = tokio::spawn(async move { accept_client(&listener).await });
        let seen = events_until(&mut events, ConnectionState::Connected).await;

        assert!(matches!(seen[0], SessionEvent::Disconnected { .. }));
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::Reconnecting,
                ConnectionState::Connecting,
                ConnectionState::Handshaking,
                ConnectionState::Initializing,
                ConnectionState::Connected,
            ]
        );
        let (_stream, frames) = device.await.unwrap();
        assert_eq!(frames[0], handshake_body(&ClientIdentity::default()));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_silences_session() {
        let (listener, addr) = listener().await;
        let (mut session, mut events) = ConnectionSession::new(test_config(addr));
        session.start();

        let (mut stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        session.stop().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // The socket is closed and nothing further is reported.
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_attempt_budget_fails_after_one_connect() {
        let (listener, addr) = listener().await;
        drop(listener);

        let mut config = test_config(addr);
        config.reconnect.max_attempts = 1;
        let (mut session, mut events) = ConnectionSession::new(config);
        session.start();

        let seen = events_until(&mut events, ConnectionState::Failed).await;
        assert_eq!(
            states(&seen),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Reconnecting,
                ConnectionState::Failed,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_interrupts_backoff() {
        let (listener, addr) = listener().await;
        let mut config = test_config(addr);
        config.reconnect.base_delay = Duration::from_secs(60);
        config.reconnect.max_delay = Duration::from_secs(60);
        let (mut session, mut events) = ConnectionSession::new(config);
        session.start();

        let (stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;
        drop(stream);
        events_until(&mut events, ConnectionState::Reconnecting).await;

        // Commands are refused while the old connection is gone.
        assert!(matches!(
            session.submit(Command::new("late")),
            Err(SessionError::NotConnected(ConnectionState::Reconnecting))
        ));

        tokio::time::timeout(Duration::from_secs(1), session.stop())
            .await
            .expect("stop waited for the backoff delay");
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.is_running());
        assert!(events.try_recv().is_err());
    }

    fn detached_worker(events: mpsc::UnboundedSender<SessionEvent>) -> (Worker, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker::new(
            Arc::new(SessionConfig::default()),
            Arc::new(CommandQueue::new()),
            Arc::new(ConnectionStateWatch::new()),
            events,
            shutdown_rx,
        );
        (worker, shutdown_tx)
    }

    #[tokio::test]
    async fn test_failed_latency_write_reports_send_failure() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (mut worker, _shutdown) = detached_worker(events_tx);

        let (mut writer, mut peer) = tokio::io::duplex(256);
        worker.send_probe(&mut writer).await.unwrap();
        assert!(worker.probe.is_pending());
        assert_eq!(read_frame(&mut peer).await.unwrap(), br#"{"request":"22"}"#);

        // The peer going away turns the next write into a connection error.
        drop(peer);
        worker.probe.reset();
        let result = worker.send_probe(&mut writer).await;
        assert!(matches!(result, Err(SessionError::Frame(_))), "{result:?}");
        assert!(!worker.probe.is_pending());
        assert_eq!(worker.probe.consecutive_missed(), 1);

        match events.try_recv() {
            Ok(SessionEvent::Latency {
                sample: LatencySample::SendFailed,
                stats,
            }) => assert_eq!(stats.samples, 0),
            other => panic!("expected a send-failure sample, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_latency_round_trip_reported() {
        let (listener, addr) = listener().await;
        let mut config = test_config(addr);
        config.probe = ProbeConfig {
            enabled: true,
            interval: Duration::from_millis(30),
            timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let (mut session, mut events) = ConnectionSession::new(config);
        session.start();

        let (mut stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        let probe = read_frame(&mut stream).await.unwrap();
        assert_eq!(probe, br#"{"request":"22"}"#);
        stream.write_all(br#"{"success":"1"}"#).await.unwrap();

        loop {
            match next_event(&mut events).await {
                SessionEvent::Latency {
                    sample: LatencySample::Measured(rtt),
                    stats,
                } => {
                    assert!(rtt < Duration::from_secs(2));
                    assert_eq!(stats.samples, 1);
                    assert_eq!(stats.min, Some(rtt));
                    assert_eq!(stats.max, Some(rtt));
                    break;
                }
                SessionEvent::Latency { sample, .. } => panic!("unexpected sample {sample:?}"),
                _ => {}
            }
        }

        session.stop().await;
    }

    #[tokio::test]
    async fn test_unanswered_latency_checks_trigger_reconnect() {
        let (listener, addr) = listener().await;
        let mut config = test_config(addr);
        config.probe = ProbeConfig {
            enabled: true,
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(20),
            max_missed: 2,
            ..Default::default()
        };
        let (mut session, mut events) = ConnectionSession::new(config);
        session.start();

        let (_stream, _) = accept_client(&listener).await;
        events_until(&mut events, ConnectionState::Connected).await;

        let seen = events_until(&mut events, ConnectionState::Reconnecting).await;
        let timeouts = seen
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Latency {
                        sample: LatencySample::TimedOut(_),
                        ..
                    }
                )
            })
            .count();
        assert_eq!(timeouts, 2);
        assert!(seen.iter().any(|e| matches!(
            e,
            SessionEvent::Disconnected { reason } if reason.contains("unanswered")
        )));

        session.stop().await;
    }
}
