//! Framed TCP channel to the remote note peer.
//!
//! The channel connects out to the peer (trying a list of well-known ports when
//! none is configured), writes length-prefixed note-update frames, and runs one
//! background read task per connection that decodes inbound frames into
//! [`ChannelEvent`]s on an unbounded channel.

use note_sync_core::protocol::{encode_event_frame, FrameDecoder};
use note_sync_core::SyncEvent;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Ports tried, in order, when no port is configured.
pub const DEFAULT_CANDIDATE_PORTS: [u16; 5] = [8080, 3000, 5000, 8000, 9000];

/// Size of each socket read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Connection settings for a [`FramedChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Remote host name or address
    pub host: String,
    /// Fixed port; `None` tries `candidate_ports` in order
    pub port: Option<u16>,
    /// Ports tried when `port` is `None`
    pub candidate_ports: Vec<u16>,
    /// Bound on each connection attempt
    pub connect_timeout: Duration,
    /// Bound on each socket read
    pub read_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
        }
    }
}

impl ChannelConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Default::default()
        }
    }

    /// Ports to attempt, in order.
    pub fn ports_to_try(&self) -> Vec<u16> {
        match self.port {
            Some(port) => vec![port],
            None => self.candidate_ports.clone(),
        }
    }
}

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connected,
    Disconnected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Connected => f.write_str("Connected"),
            ChannelState::Disconnected => f.write_str("Disconnected"),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket
    PeerClosed,
    /// `disconnect()` was called, or a write failed
    Local,
    /// The socket read failed
    Io(String),
}

/// Event emitted by the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A connection was established. Emitted once per connection, before any
    /// message from it.
    Connected { port: u16 },
    /// A note-update message decoded from the peer
    Message(SyncEvent),
    /// The connection on `port` ended
    Closed { port: u16, reason: CloseReason },
}

/// One established connection: socket halves, close signal and read task.
struct Session {
    port: u16,
    /// `true` once closed. Wakes the read task and any in-flight write.
    closed: watch::Sender<bool>,
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Mark closed. Returns true if this call did the transition.
    fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once the session is closed.
    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Send FIN without waiting for the writer lock. A sender holding the
    /// lock sees the close and shuts the write half down itself.
    async fn shutdown_write(&self) {
        if let Ok(mut write) = self.write.try_lock() {
            if let Err(e) = write.shutdown().await {
                debug!("Shutdown of port {} failed: {}", self.port, e);
            }
        }
    }
}

/// The channel's current session, shared with the read task so it can
/// release the session when the connection ends.
type SessionSlot = Arc<Mutex<Option<Arc<Session>>>>;

/// Clear `slot` if it still holds `session`.
fn release(slot: &Mutex<Option<Arc<Session>>>, session: &Arc<Session>) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if guard.as_ref().is_some_and(|held| Arc::ptr_eq(held, session)) {
        guard.take();
    }
}

/// Length-prefixed message channel over TCP.
pub struct FramedChannel {
    config: ChannelConfig,
    session: SessionSlot,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl FramedChannel {
    /// Create a disconnected channel and the receiver for its events.
    pub fn new(config: ChannelConfig) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                session: Arc::new(Mutex::new(None)),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The current session, if it is still open.
    fn open_session(&self) -> Option<Arc<Session>> {
        let guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().filter(|s| s.is_open()).cloned()
    }

    pub fn state(&self) -> ChannelState {
        if self.open_session().is_some() {
            ChannelState::Connected
        } else {
            ChannelState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Port of the open connection.
    pub fn port(&self) -> Option<u16> {
        self.open_session().map(|s| s.port)
    }

    /// Connect to the peer.
    ///
    /// Tries the configured port, or each candidate port in order, and stops
    /// at the first success. Returns the port used, or `None` when every
    /// attempt failed. Failure is only logged: nothing has been sent yet.
    pub async fn connect(&self) -> Option<u16> {
        if let Some(port) = self.port() {
            debug!("Already connected to {}:{}", self.config.host, port);
            return Some(port);
        }

        for port in self.config.ports_to_try() {
            info!("Trying to connect to {}:{}", self.config.host, port);

            let attempt = timeout(
                self.config.connect_timeout,
                TcpStream::connect((self.config.host.as_str(), port)),
            )
            .await;

            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Failed to connect on port {}: {}", port, e);
                    continue;
                }
                Err(_) => {
                    debug!(
                        "Connecting on port {} timed out after {:?}",
                        port, self.config.connect_timeout
                    );
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY: {}", e);
            }

            self.start_session(stream, port);
            info!("Connected to {}:{}", self.config.host, port);
            return Some(port);
        }

        warn!(
            "Could not connect to {} on any of ports {:?}",
            self.config.host,
            self.config.ports_to_try()
        );
        None
    }

    fn start_session(&self, stream: TcpStream, port: u16) {
        let (read, write) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let session = Arc::new(Session {
            port,
            closed,
            write: tokio::sync::Mutex::new(write),
            read_task: Mutex::new(None),
        });

        let previous = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Arc::clone(&session));
        if let Some(previous) = previous {
            previous.close();
        }

        // Connected goes out before the read task can emit any message
        let _ = self.event_tx.send(ChannelEvent::Connected { port });

        let task = tokio::spawn(Self::read_loop(
            Arc::clone(&self.session),
            Arc::clone(&session),
            read,
            self.event_tx.clone(),
            self.config.read_timeout,
        ));
        *session.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    /// Read loop that decodes frames and forwards them to the event channel.
    async fn read_loop(
        slot: SessionSlot,
        session: Arc<Session>,
        mut reader: OwnedReadHalf,
        event_tx: mpsc::UnboundedSender<ChannelEvent>,
        read_timeout: Duration,
    ) {
        let port = session.port;
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = session.closed() => break CloseReason::Local,
                read = timeout(read_timeout, reader.read(&mut buf)) => read,
            };

            let n = match read {
                // Read timeout: go round and check the close signal
                Err(_) => continue,
                Ok(Ok(0)) => break CloseReason::PeerClosed,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    error!("Error receiving on port {}: {}", port, e);
                    break CloseReason::Io(e.to_string());
                }
            };

            decoder.extend(&buf[..n]);
            while let Some(frame) = decoder.next_frame() {
                let payload = match frame {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping frame from port {}: {}", port, e);
                        continue;
                    }
                };

                match SyncEvent::from_json(&payload) {
                    Ok(Some(event)) => {
                        debug!(
                            "Received {} for note {} ({} bytes)",
                            event.action(),
                            event.note_id(),
                            payload.len()
                        );
                        let _ = event_tx.send(ChannelEvent::Message(event));
                    }
                    Ok(None) => {
                        debug!("Ignoring message of unknown type ({} bytes)", payload.len());
                    }
                    Err(e) => {
                        warn!("Dropping undecodable message ({} bytes): {}", payload.len(), e);
                    }
                }
            }
        };

        // Tear the whole socket down; the read half drops with this task
        session.close();
        release(&slot, &session);
        session.shutdown_write().await;

        match &reason {
            CloseReason::PeerClosed => info!("Peer on port {} closed the connection", port),
            CloseReason::Local => debug!("Read task for port {} stopped", port),
            CloseReason::Io(_) => {}
        }

        // Notify that connection is closed
        let _ = event_tx.send(ChannelEvent::Closed { port, reason });
    }

    /// Send one event to the peer.
    ///
    /// The whole frame is written under the session's write lock, so frames
    /// from concurrent senders never interleave. Returns whether the frame
    /// reached the socket. Not being connected is a silent no-op. A write
    /// failure closes the session, and a `disconnect()` during the write
    /// abandons it.
    pub async fn send(&self, event: &SyncEvent) -> bool {
        let Some(session) = self.open_session() else {
            return false;
        };

        let frame = match encode_event_frame(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode {} for note {}: {}", event.action(), event.note_id(), e);
                return false;
            }
        };

        let mut write = session.write.lock().await;
        let written = tokio::select! {
            biased;
            _ = session.closed() => None,
            result = write.write_all(&frame) => Some(result),
        };

        let sent = match written {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                error!("Error sending message on port {}: {}", session.port, e);
                session.close();
                release(&self.session, &session);
                false
            }
            None => {
                debug!("Send of note {} abandoned, port {} closed", event.note_id(), session.port);
                false
            }
        };

        if !session.is_open() {
            if let Err(e) = write.shutdown().await {
                debug!("Shutdown of port {} failed: {}", session.port, e);
            }
        }
        sent
    }

    /// Close the connection. Safe to call repeatedly or when never connected.
    ///
    /// Returns without waiting for in-flight sends; they are abandoned. The
    /// read task exits as soon as it sees the close.
    pub async fn disconnect(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let Some(session) = session else {
            return;
        };

        if session.close() {
            info!("Disconnected from {}:{}", self.config.host, session.port);
        }
        session.shutdown_write().await;
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.close();
            let task = session
                .read_task
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Some(task) = task {
                task.abort();
            }
        }
    }
}
