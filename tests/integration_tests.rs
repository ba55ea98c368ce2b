// Integration tests for peerdrop
// These run the real rendezvous server on an ephemeral port and talk to it
// over websockets, plus end-to-end checks of the cipher and chunk engine.

use futures_util::{SinkExt, StreamExt};
use peerdrop::{
    bytes::{split_chunks, Reassembler},
    cryptography::{decode_key, decrypt_file, encode_key, encrypt_file, generate_key},
    error::DecryptionError,
    networking::{run_signaling_link, LinkEvent},
    rendezvous::RendezvousServer,
    signaling::SignalingEnvelope,
    utils::{ControlMessage, FileMetadata},
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(first: u64) -> SocketAddr {
    let server = RendezvousServer::bind("127.0.0.1:0")
        .await
        .expect("Should bind")
        .with_first_peer_number(first);
    let addr = server.local_addr().expect("Should have address");
    tokio::spawn(server.run());
    addr
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.expect("Should connect");
    ws
}

async fn next_envelope(ws: &mut Ws) -> SignalingEnvelope {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("Timed out waiting for envelope")
            .expect("Stream ended")
            .expect("Websocket error");
        if let Message::Text(text) = frame {
            return SignalingEnvelope::from_json(&text).expect("Server sent invalid envelope");
        }
    }
}

async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string())).await.expect("Should send");
}

async fn assert_silent(ws: &mut Ws) {
    if let Ok(Some(Ok(Message::Text(text)))) = timeout(Duration::from_millis(300), ws.next()).await {
        panic!("Expected no message, got {}", text);
    }
}

async fn next_link(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
    timeout(WAIT, rx.recv()).await.expect("Timed out").expect("Link stopped")
}

fn peers(ids: &[&str]) -> SignalingEnvelope {
    SignalingEnvelope::PeerListUpdate { peers: ids.iter().map(|s| s.to_string()).collect() }
}

/// Two registered clients with their greeting traffic already consumed.
async fn two_clients() -> (Ws, Ws) {
    let addr = start_server(123).await;
    let mut a = connect(addr).await;
    next_envelope(&mut a).await;
    next_envelope(&mut a).await;

    let mut b = connect(addr).await;
    next_envelope(&mut b).await;
    next_envelope(&mut b).await;
    next_envelope(&mut a).await;
    (a, b)
}

// ============================================================================
// Rendezvous Server Tests
// ============================================================================

#[tokio::test]
async fn test_discovery() {
    let addr = start_server(123).await;

    let mut a = connect(addr).await;
    assert_eq!(next_envelope(&mut a).await, SignalingEnvelope::PeerAssigned { peer_id: "peer-123".into() });
    assert_eq!(next_envelope(&mut a).await, peers(&["peer-123"]));

    let mut b = connect(addr).await;
    assert_eq!(next_envelope(&mut b).await, SignalingEnvelope::PeerAssigned { peer_id: "peer-124".into() });
    assert_eq!(next_envelope(&mut b).await, peers(&["peer-123", "peer-124"]));
    assert_eq!(next_envelope(&mut a).await, peers(&["peer-123", "peer-124"]));
}

#[tokio::test]
async fn test_relay_reaches_others_only() {
    let (mut a, mut b) = two_clients().await;

    let request = SignalingEnvelope::request("peer-124", "peer-123");
    send_text(&mut a, &request.to_json().unwrap()).await;

    assert_eq!(next_envelope(&mut b).await, request);
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_relay_ignores_target() {
    let (mut a, mut b) = two_clients().await;

    // addressed to nobody online, still delivered
    let ack = SignalingEnvelope::ack("peer-999");
    send_text(&mut a, &ack.to_json().unwrap()).await;
    assert_eq!(next_envelope(&mut b).await, ack);
}

#[tokio::test]
async fn test_invalid_message_keeps_connection() {
    let (mut a, mut b) = two_clients().await;

    send_text(&mut a, "this is not json").await;
    send_text(&mut a, r#"{"unknown":"shape"}"#).await;
    assert_silent(&mut b).await;

    let ack = SignalingEnvelope::ack("peer-124");
    send_text(&mut a, &ack.to_json().unwrap()).await;
    assert_eq!(next_envelope(&mut b).await, ack);
}

#[tokio::test]
async fn test_binary_frames_carry_envelopes() {
    let (mut a, mut b) = two_clients().await;

    a.send(Message::Binary(vec![0xff, 0x00, 0x7b])).await.expect("Should send");
    assert_silent(&mut b).await;

    let ack = SignalingEnvelope::ack("peer-124");
    a.send(Message::Binary(ack.to_json().unwrap().into_bytes())).await.expect("Should send");
    assert_eq!(next_envelope(&mut b).await, ack);
}

#[tokio::test]
async fn test_disconnect_rebroadcasts_peers() {
    let (mut a, mut b) = two_clients().await;

    b.close(None).await.expect("Should close");
    assert_eq!(next_envelope(&mut a).await, peers(&["peer-123"]));
}

// ============================================================================
// Signaling Link Tests
// ============================================================================

#[tokio::test]
async fn test_signaling_link_round_trip() {
    let addr = start_server(500).await;
    let mut other = connect(addr).await;
    next_envelope(&mut other).await;
    next_envelope(&mut other).await;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_signaling_link(format!("ws://{}", addr), Duration::from_millis(100), out_rx, in_tx));

    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Connected);
    assert_eq!(
        next_link(&mut in_rx).await,
        LinkEvent::Envelope(SignalingEnvelope::PeerAssigned { peer_id: "peer-501".into() })
    );
    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Envelope(peers(&["peer-500", "peer-501"])));

    let request = SignalingEnvelope::request("peer-500", "peer-501");
    out_tx.send(request.clone()).unwrap();
    assert_eq!(next_envelope(&mut other).await, peers(&["peer-500", "peer-501"]));
    assert_eq!(next_envelope(&mut other).await, request);

    let ack = SignalingEnvelope::ack("peer-501");
    send_text(&mut other, &ack.to_json().unwrap()).await;
    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Envelope(ack));
}

#[tokio::test]
async fn test_signaling_link_retries_until_server_appears() {
    // grab a free port, then release it so the first attempts fail
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (_out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_signaling_link(format!("ws://{}", addr), Duration::from_millis(100), out_rx, in_tx));

    tokio::time::sleep(Duration::from_millis(250)).await;
    let server = RendezvousServer::bind(&addr.to_string()).await.expect("Should bind").with_first_peer_number(1);
    tokio::spawn(server.run());

    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Connected);
}

#[tokio::test]
async fn test_signaling_link_survives_server_restart() {
    let server = RendezvousServer::bind("127.0.0.1:0").await.expect("Should bind").with_first_peer_number(1);
    let addr = server.local_addr().expect("Should have address");
    let running = tokio::spawn(server.run());

    let (_out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, mut in_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_signaling_link(format!("ws://{}", addr), Duration::from_millis(100), out_rx, in_tx));

    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Connected);
    assert_eq!(
        next_link(&mut in_rx).await,
        LinkEvent::Envelope(SignalingEnvelope::PeerAssigned { peer_id: "peer-1".into() })
    );
    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Envelope(peers(&["peer-1"])));

    // stopping the server drops every open connection with it
    running.abort();
    let _ = running.await;
    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Disconnected);

    let server = RendezvousServer::bind(&addr.to_string()).await.expect("Should rebind").with_first_peer_number(50);
    tokio::spawn(server.run());

    assert_eq!(next_link(&mut in_rx).await, LinkEvent::Connected);
    assert_eq!(
        next_link(&mut in_rx).await,
        LinkEvent::Envelope(SignalingEnvelope::PeerAssigned { peer_id: "peer-50".into() })
    );
}

// ============================================================================
// End-to-End Cipher and Chunking Tests
// ============================================================================

#[test]
fn test_encrypted_file_survives_chunked_transfer() {
    let key = generate_key();
    let shared = encode_key(&key);
    let file: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

    let blob = encrypt_file(&key, &file);
    assert_eq!(blob.len(), 16 + (file.len() / 16 + 1) * 16);

    let mut reassembler = Reassembler::new();
    reassembler.set_metadata(FileMetadata { name: "photo.jpg".into(), size: blob.len() as u64 });
    for chunk in split_chunks(&blob) {
        // chunks never look like control messages
        assert_eq!(ControlMessage::parse(chunk), None);
        reassembler.push(chunk);
    }
    assert_eq!(reassembler.received(), blob.len() as u64);
    let received = reassembler.finish();

    let receiver_key = decode_key(&shared).expect("Key should decode");
    assert_eq!(decrypt_file(&receiver_key, &received).expect("Should decrypt"), file);
}

#[test]
fn test_truncated_transfer_fails_decryption() {
    let key = generate_key();
    let blob = encrypt_file(&key, b"some secret bytes");

    assert_eq!(decrypt_file(&key, &blob[..10]), Err(DecryptionError::Truncated));
    assert_eq!(decrypt_file(&key, &blob[..blob.len() - 1]), Err(DecryptionError::Invalid));
}
