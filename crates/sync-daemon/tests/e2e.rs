//! End-to-end tests for note-sync-daemon.
//!
//! Tests the full client behavior against a real TCP peer: port discovery,
//! framing over the socket, full pushes, remote view updates and disconnects.

use std::sync::Arc;
use std::time::Duration;

use note_sync_core::protocol::{encode_event_frame, encode_frame, FrameDecoder};
use note_sync_core::{InMemoryStore, Note, NoteId, SyncEvent};
use note_sync_daemon::{
    ChannelConfig, ChannelEvent, CloseReason, FramedChannel, SyncError, SyncManager,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// How long a close may take to surface: one read timeout plus scheduling slack.
const CLOSE_BOUND: Duration = READ_TIMEOUT.saturating_add(Duration::from_millis(200));

/// The far end of the connection, speaking raw frames.
struct TestPeer {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl TestPeer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept())
            .await
            .expect("Timeout waiting for connection")
            .expect("Failed to accept");
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    /// Receive and decode the next note-update frame.
    async fn recv_event(&mut self) -> SyncEvent {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                let payload = frame.expect("Invalid frame");
                return SyncEvent::from_json(&payload)
                    .expect("Invalid message")
                    .expect("Unexpected message type");
            }
            let n = timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("Timeout waiting for frame")
                .expect("Read failed");
            assert!(n > 0, "Connection closed while waiting for frame");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn send_event(&mut self, event: &SyncEvent) {
        self.send_raw(&encode_event_frame(event).unwrap()).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }
}

async fn create_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
async fn dead_port() -> u16 {
    let (listener, port) = create_listener().await;
    drop(listener);
    port
}

fn test_config(port: u16) -> ChannelConfig {
    ChannelConfig {
        port: Some(port),
        connect_timeout: Duration::from_secs(2),
        read_timeout: READ_TIMEOUT,
        ..ChannelConfig::new("127.0.0.1")
    }
}

/// Connect a bare channel to a fresh listener.
async fn connected_channel() -> (FramedChannel, UnboundedReceiver<ChannelEvent>, TestPeer) {
    let (listener, port) = create_listener().await;
    let (channel, mut events) = FramedChannel::new(test_config(port));

    assert_eq!(channel.connect().await, Some(port));
    let peer = TestPeer::accept(&listener).await;

    match next_event(&mut events).await {
        ChannelEvent::Connected { port: p } => assert_eq!(p, port),
        other => panic!("Expected Connected, got {:?}", other),
    }
    (channel, events, peer)
}

async fn next_event(events: &mut UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("Timeout waiting for channel event")
        .expect("Event channel closed")
}

/// Expect `Closed` within one read timeout plus slack.
async fn expect_closed_promptly(events: &mut UnboundedReceiver<ChannelEvent>) -> CloseReason {
    match timeout(CLOSE_BOUND, events.recv()).await {
        Ok(Some(ChannelEvent::Closed { reason, .. })) => reason,
        Ok(other) => panic!("Expected Closed, got {:?}", other),
        Err(_) => panic!("Closed not reported within {:?}", CLOSE_BOUND),
    }
}

async fn next_message(events: &mut UnboundedReceiver<ChannelEvent>) -> SyncEvent {
    match next_event(events).await {
        ChannelEvent::Message(event) => event,
        other => panic!("Expected Message, got {:?}", other),
    }
}

/// Poll until `cond` holds.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Condition not reached in time");
}

fn note(id: &str, text: &str) -> Note {
    Note::from_plain_text(text).with_id(id)
}

/// A manager over an in-memory store, with its event loop running.
fn spawn_manager(
    store: InMemoryStore,
    config: ChannelConfig,
) -> (Arc<SyncManager<InMemoryStore>>, JoinHandle<()>) {
    let (channel, events) = FramedChannel::new(config);
    let manager = Arc::new(SyncManager::new(store, channel));
    let handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run(events).await })
    };
    (manager, handle)
}

// ============================================================================
// Port discovery
// ============================================================================

#[tokio::test]
async fn test_connect_tries_candidate_ports_in_order() {
    let dead_a = dead_port().await;
    let dead_b = dead_port().await;
    let (listener, live) = create_listener().await;

    let config = ChannelConfig {
        port: None,
        candidate_ports: vec![dead_a, dead_b, live],
        ..test_config(0)
    };
    let (channel, mut events) = FramedChannel::new(config);

    assert_eq!(channel.connect().await, Some(live));
    assert_eq!(channel.port(), Some(live));
    assert!(channel.is_connected());

    let _peer = TestPeer::accept(&listener).await;
    assert!(matches!(
        next_event(&mut events).await,
        ChannelEvent::Connected { port } if port == live
    ));
}

#[tokio::test]
async fn test_connect_fails_when_no_port_answers() {
    let config = ChannelConfig {
        port: None,
        candidate_ports: vec![dead_port().await, dead_port().await],
        ..test_config(0)
    };
    let (channel, _events) = FramedChannel::new(config);

    assert_eq!(channel.connect().await, None);
    assert!(!channel.is_connected());
    assert!(!channel.send(&SyncEvent::Delete(NoteId::from("x"))).await);
}

#[tokio::test]
async fn test_connect_while_connected_keeps_session() {
    let (channel, _events, _peer) = connected_channel().await;
    let port = channel.port();

    assert_eq!(channel.connect().await, port);
    assert_eq!(channel.port(), port);
}

// ============================================================================
// Framing over the socket
// ============================================================================

#[tokio::test]
async fn test_send_writes_one_frame_per_event() {
    let (channel, _events, mut peer) = connected_channel().await;

    assert!(channel.send(&SyncEvent::Create(note("A", "first"))).await);
    assert!(channel.send(&SyncEvent::Delete(NoteId::from("A"))).await);

    match peer.recv_event().await {
        SyncEvent::Create(n) => {
            assert_eq!(n.id.as_str(), "A");
            assert_eq!(n.body.plain_text().as_deref(), Some("first"));
        }
        other => panic!("Expected create, got {:?}", other),
    }
    assert_eq!(peer.recv_event().await, SyncEvent::Delete(NoteId::from("A")));
}

#[tokio::test]
async fn test_concurrent_senders_never_interleave() {
    let (channel, _events, mut peer) = connected_channel().await;
    let channel = Arc::new(channel);

    let senders: Vec<_> = (0..4)
        .map(|task| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move {
                for i in 0..5 {
                    let id = format!("t{task}-{i}");
                    let body = format!("{id} ").repeat(16 * 1024);
                    assert!(channel.send(&SyncEvent::Create(note(&id, &body))).await);
                }
            })
        })
        .collect();

    let mut received = Vec::new();
    for _ in 0..20 {
        match peer.recv_event().await {
            SyncEvent::Create(n) => {
                let id = n.id.to_string();
                let text = n.body.plain_text().expect("Body did not survive framing");
                assert!(text.starts_with(&format!("{id} ")));
                received.push(id);
            }
            other => panic!("Expected create, got {:?}", other),
        }
    }
    for sender in senders {
        sender.await.unwrap();
    }

    received.sort();
    let mut expected: Vec<String> = (0..4)
        .flat_map(|task| (0..5).map(move |i| format!("t{task}-{i}")))
        .collect();
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (_channel, mut events, mut peer) = connected_channel().await;

    let frame = encode_event_frame(&SyncEvent::Create(note("S", "split"))).unwrap();
    // Cut inside the header, then inside the payload
    for chunk in [&frame[..2], &frame[2..10], &frame[10..]] {
        peer.send_raw(chunk).await;
        sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(next_message(&mut events).await.note_id().as_str(), "S");
}

#[tokio::test]
async fn test_multiple_frames_in_one_write() {
    let (_channel, mut events, mut peer) = connected_channel().await;

    let mut bytes = Vec::new();
    for id in ["1", "2", "3"] {
        bytes.extend(encode_event_frame(&SyncEvent::Create(note(id, id))).unwrap());
    }
    peer.send_raw(&bytes).await;

    for id in ["1", "2", "3"] {
        assert_eq!(next_message(&mut events).await.note_id().as_str(), id);
    }
}

#[tokio::test]
async fn test_corrupt_frame_is_dropped() {
    let (channel, mut events, mut peer) = connected_channel().await;

    peer.send_raw(&encode_frame(br#"{"type":"note_update","action":"cre"#).unwrap())
        .await;
    peer.send_event(&SyncEvent::Create(note("good", "still here"))).await;

    assert_eq!(next_message(&mut events).await.note_id().as_str(), "good");
    assert!(channel.is_connected());
}

#[tokio::test]
async fn test_unknown_message_type_is_ignored() {
    let (_channel, mut events, mut peer) = connected_channel().await;

    peer.send_raw(&encode_frame(br#"{"type":"ping"}"#).unwrap()).await;
    peer.send_event(&SyncEvent::Delete(NoteId::from("after"))).await;

    assert_eq!(
        next_message(&mut events).await,
        SyncEvent::Delete(NoteId::from("after"))
    );
}

// ============================================================================
// Disconnects
// ============================================================================

#[tokio::test]
async fn test_peer_close_is_detected() {
    let (channel, mut events, peer) = connected_channel().await;
    drop(peer);

    assert_eq!(expect_closed_promptly(&mut events).await, CloseReason::PeerClosed);
    assert!(!channel.is_connected());
    assert!(!channel.send(&SyncEvent::Create(note("late", "late"))).await);
}

#[tokio::test]
async fn test_local_disconnect() {
    let (channel, mut events, _peer) = connected_channel().await;

    channel.disconnect().await;
    assert!(!channel.is_connected());
    assert_eq!(channel.port(), None);

    assert_eq!(expect_closed_promptly(&mut events).await, CloseReason::Local);

    // Second disconnect is a no-op
    channel.disconnect().await;
}

#[tokio::test]
async fn test_peer_half_close_tears_socket_down() {
    let (channel, mut events, mut peer) = connected_channel().await;

    peer.stream.shutdown().await.unwrap();

    assert_eq!(expect_closed_promptly(&mut events).await, CloseReason::PeerClosed);
    assert!(!channel.is_connected());

    // Our side must close too, not linger half-open
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), peer.stream.read(&mut buf))
        .await
        .expect("Peer never saw EOF")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_disconnect_with_stalled_send() {
    let (channel, _events, _peer) = connected_channel().await;
    let channel = Arc::new(channel);

    // The peer never reads, so the socket buffers fill and a write blocks
    let big = SyncEvent::Create(note("big", &"x".repeat(8 * 1024 * 1024)));
    let writer = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { while channel.send(&big).await {} })
    };
    sleep(Duration::from_millis(500)).await;

    timeout(Duration::from_secs(3), channel.disconnect())
        .await
        .expect("disconnect blocked behind a stalled send");
    assert!(!channel.is_connected());

    timeout(Duration::from_secs(3), writer)
        .await
        .expect("Stalled send was not abandoned")
        .unwrap();
}

// ============================================================================
// Sync manager
// ============================================================================

#[tokio::test]
async fn test_full_push_on_connect() {
    let (listener, port) = create_listener().await;
    let store = InMemoryStore::with_notes(vec![note("A", "alpha"), note("B", "beta")]);
    let (manager, _run) = spawn_manager(store, test_config(port));

    assert_eq!(manager.connect().await, Some(port));
    let mut peer = TestPeer::accept(&listener).await;

    let first = peer.recv_event().await;
    let second = peer.recv_event().await;
    assert!(matches!(&first, SyncEvent::Create(n) if n.id.as_str() == "A"));
    assert!(matches!(&second, SyncEvent::Create(n) if n.id.as_str() == "B"));

    wait_until(|| manager.last_sync_at().is_some()).await;
}

#[tokio::test]
async fn test_sync_now_pushes_again() {
    let (listener, port) = create_listener().await;
    let store = InMemoryStore::with_notes(vec![note("A", "alpha")]);
    let (manager, _run) = spawn_manager(store, test_config(port));

    manager.connect().await;
    let mut peer = TestPeer::accept(&listener).await;
    assert_eq!(peer.recv_event().await.note_id().as_str(), "A");

    let report = manager.sync_now().await.unwrap();
    assert_eq!((report.total, report.pushed), (1, 1));
    assert_eq!(peer.recv_event().await.note_id().as_str(), "A");

    manager.disconnect().await;
    assert!(matches!(manager.sync_now().await, Err(SyncError::NotConnected)));
}

#[tokio::test]
async fn test_reconnect_pushes_full_set_again() {
    let (listener, port) = create_listener().await;
    let store = InMemoryStore::with_notes(vec![note("A", "alpha")]);
    let (manager, _run) = spawn_manager(store, test_config(port));

    manager.connect().await;
    let mut first = TestPeer::accept(&listener).await;
    assert_eq!(first.recv_event().await.note_id().as_str(), "A");

    manager.disconnect().await;
    assert_eq!(manager.connect().await, Some(port));
    let mut second = TestPeer::accept(&listener).await;
    assert_eq!(second.recv_event().await.note_id().as_str(), "A");
}

#[tokio::test]
async fn test_remote_changes_update_view() {
    let (listener, port) = create_listener().await;
    let (manager, _run) = spawn_manager(InMemoryStore::new(), test_config(port));

    manager.connect().await;
    let mut peer = TestPeer::accept(&listener).await;

    // Update before create is ignored; the create after it lands
    peer.send_event(&SyncEvent::Update(note("X", "orphan"))).await;
    peer.send_event(&SyncEvent::Create(note("Y", "from peer"))).await;

    wait_until(|| manager.remote_note(&NoteId::from("Y")).is_some()).await;
    assert!(manager.remote_note(&NoteId::from("X")).is_none());

    let y = manager.remote_note(&NoteId::from("Y")).unwrap();
    assert_eq!(y.body.plain_text().as_deref(), Some("from peer"));

    peer.send_event(&SyncEvent::Delete(NoteId::from("Y"))).await;
    wait_until(|| manager.remote_notes().is_empty()).await;

    // Remote changes never touch the local store by default
    assert!(manager.store().is_empty());
}

#[tokio::test]
async fn test_status_reflects_connection() {
    let (listener, port) = create_listener().await;
    let (manager, _run) = spawn_manager(InMemoryStore::new(), test_config(port));

    assert!(manager.status().to_string().starts_with("Status: Disconnected"));

    manager.connect().await;
    let _peer = TestPeer::accept(&listener).await;

    let status = manager.status();
    assert_eq!(status.port, Some(port));
    assert!(
        status
            .to_string()
            .starts_with(&format!("Status: Connected (127.0.0.1:{})", port))
    );
}
