use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Receiver, Sender, UnboundedSender};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::signaling::{PeerId, SignalingEnvelope};

/// Identifies one accepted websocket for the lifetime of the server.
pub type ConnId = u64;

/// Requests from connection tasks to the registry manager.
#[derive(Debug)]
pub enum Message {
    Connected {
        conn: ConnId,
        outbound: UnboundedSender<String>,
    },
    Relay {
        from: ConnId,
        envelope: SignalingEnvelope,
    },
    Disconnected {
        conn: ConnId,
    },
}

pub struct Peer {
    pub id: PeerId,
    pub outbound: UnboundedSender<String>,
}

/// Owner of the peer registry. Only `registry_manager` touches it, so every
/// registration, relay and removal is applied in one order.
pub struct ConnectionManager {
    pub peers: BTreeMap<ConnId, Peer>,
    next_peer: u64,
    pub receiver_channel: Receiver<Message>,
}

impl ConnectionManager {
    /// Peer numbers start from the server's start time in milliseconds and
    /// count up, so an id is never handed out twice by one server.
    pub fn new(receiver_channel: Receiver<Message>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::with_first_id(receiver_channel, seed)
    }

    pub fn with_first_id(receiver_channel: Receiver<Message>, first: u64) -> Self {
        ConnectionManager {
            peers: BTreeMap::new(),
            next_peer: first,
            receiver_channel,
        }
    }

    fn allocate_id(&mut self) -> PeerId {
        let id = format!("peer-{}", self.next_peer);
        self.next_peer += 1;
        id
    }

    /// Peer ids in connection order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.values().map(|p| p.id.clone()).collect()
    }

    pub fn register(&mut self, conn: ConnId, outbound: UnboundedSender<String>) {
        let id = self.allocate_id();
        info!("Registered {} (connection {})", id, conn);

        deliver(&outbound, &SignalingEnvelope::PeerAssigned { peer_id: id.clone() });
        self.peers.insert(conn, Peer { id, outbound });
        self.broadcast_peers();
    }

    /// Forward an envelope to every connection except the one it came from.
    /// `target` is not consulted; recipients filter for themselves.
    pub fn relay(&self, from: ConnId, envelope: &SignalingEnvelope) {
        let Some(sender) = self.peers.get(&from) else {
            warn!("Dropping envelope from unregistered connection {}", from);
            return;
        };
        debug!("Relaying {} from {} to {} peers", envelope.kind(), sender.id, self.peers.len() - 1);

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} envelope: {}", envelope.kind(), e);
                return;
            }
        };
        for (conn, peer) in &self.peers {
            if *conn != from && peer.outbound.send(text.clone()).is_err() {
                debug!("Connection {} is already closing", conn);
            }
        }
    }

    pub fn unregister(&mut self, conn: ConnId) {
        if let Some(peer) = self.peers.remove(&conn) {
            info!("{} disconnected", peer.id);
            self.broadcast_peers();
        }
    }

    fn broadcast_peers(&self) {
        let update = SignalingEnvelope::PeerListUpdate { peers: self.peer_ids() };
        for peer in self.peers.values() {
            deliver(&peer.outbound, &update);
        }
    }
}

fn deliver(outbound: &UnboundedSender<String>, envelope: &SignalingEnvelope) {
    match envelope.to_json() {
        Ok(text) => {
            let _ = outbound.send(text);
        }
        Err(e) => error!("Failed to encode {} envelope: {}", envelope.kind(), e),
    }
}

pub async fn registry_manager(mut manager: ConnectionManager) {
    while let Some(message) = manager.receiver_channel.recv().await {
        match message {
            Message::Connected { conn, outbound } => manager.register(conn, outbound),
            Message::Relay { from, envelope } => manager.relay(from, &envelope),
            Message::Disconnected { conn } => manager.unregister(conn),
        }
    }
    debug!("Registry manager stopped");
}

/// Serve one websocket: register it, forward what it sends to the manager
/// and write back whatever the manager queues for it. Envelopes arrive as
/// JSON in text frames, or as UTF-8 JSON in binary frames.
pub async fn handle_new_connection(stream: TcpStream, addr: SocketAddr, conn: ConnId, manager_channel: Sender<Message>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("Websocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let (outbound, mut queued) = mpsc::unbounded_channel::<String>();
    if manager_channel.send(Message::Connected { conn, outbound }).await.is_err() {
        error!("Registry manager is gone, dropping {}", addr);
        return;
    }

    loop {
        tokio::select! {
            text = queued.recv() => {
                let Some(text) = text else { break };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    debug!("Write to connection {} failed: {}", conn, e);
                    break;
                }
            }
            frame = read.next() => {
                let parsed = match frame {
                    Some(Ok(WsMessage::Text(text))) => SignalingEnvelope::from_json(&text),
                    Some(Ok(WsMessage::Binary(data))) => serde_json::from_slice(&data),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(other)) => {
                        debug!("Ignoring {} byte control frame from {}", other.len(), addr);
                        continue;
                    }
                    Some(Err(e)) => {
                        debug!("Read from {} failed: {}", addr, e);
                        break;
                    }
                };
                match parsed {
                    Ok(envelope) => {
                        if manager_channel.send(Message::Relay { from: conn, envelope }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Dropping invalid message from {}: {}", addr, e),
                }
            }
        }
    }

    let _ = manager_channel.send(Message::Disconnected { conn }).await;
    let _ = write.close().await;
    info!("Connection from {} closed", addr);
}

/// Rendezvous server bound to a listening socket.
pub struct RendezvousServer {
    listener: TcpListener,
    first_peer: Option<u64>,
}

impl RendezvousServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(RendezvousServer { listener, first_peer: None })
    }

    /// Start numbering peers at `first` instead of the current time.
    pub fn with_first_peer_number(mut self, first: u64) -> Self {
        self.first_peer = Some(first);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails. Connection tasks live
    /// in a `JoinSet`, so dropping or aborting this future closes them all.
    pub async fn run(self) -> io::Result<()> {
        let (sender_channel, receiver_channel) = mpsc::channel::<Message>(100);
        let manager = match self.first_peer {
            Some(first) => ConnectionManager::with_first_id(receiver_channel, first),
            None => ConnectionManager::new(receiver_channel),
        };

        debug!("Spawning registry manager task");
        tokio::spawn(registry_manager(manager));

        let mut connections = JoinSet::new();
        let mut next_conn: ConnId = 0;
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    info!("New client connection from: {}", addr);

                    next_conn += 1;
                    connections.spawn(handle_new_connection(stream, addr, next_conn, sender_channel.clone()));
                }
                Some(finished) = connections.join_next() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager() -> ConnectionManager {
        let (_tx, rx) = mpsc::channel(1);
        ConnectionManager::with_first_id(rx, 7)
    }

    fn connect(manager: &mut ConnectionManager, conn: ConnId) -> UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register(conn, tx);
        rx
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<SignalingEnvelope> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(SignalingEnvelope::from_json(&text).unwrap());
        }
        out
    }

    fn peers(ids: &[&str]) -> SignalingEnvelope {
        SignalingEnvelope::PeerListUpdate { peers: ids.iter().map(|s| s.to_string()).collect() }
    }

    // ============================================================================
    // Registry Tests
    // ============================================================================

    #[test]
    fn test_register_assigns_then_broadcasts() {
        let mut manager = manager();
        let mut a = connect(&mut manager, 1);
        assert_eq!(
            drain(&mut a),
            vec![SignalingEnvelope::PeerAssigned { peer_id: "peer-7".into() }, peers(&["peer-7"])]
        );

        let mut b = connect(&mut manager, 2);
        assert_eq!(
            drain(&mut b),
            vec![SignalingEnvelope::PeerAssigned { peer_id: "peer-8".into() }, peers(&["peer-7", "peer-8"])]
        );
        assert_eq!(drain(&mut a), vec![peers(&["peer-7", "peer-8"])]);
    }

    #[test]
    fn test_relay_skips_sender_and_ignores_target() {
        let mut manager = manager();
        let mut a = connect(&mut manager, 1);
        let mut b = connect(&mut manager, 2);
        let mut c = connect(&mut manager, 3);
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        let envelope = SignalingEnvelope::request("peer-8", "peer-7");
        manager.relay(1, &envelope);

        assert!(drain(&mut a).is_empty());
        assert_eq!(drain(&mut b), vec![envelope.clone()]);
        assert_eq!(drain(&mut c), vec![envelope]);
    }

    #[test]
    fn test_unregister_rebroadcasts() {
        let mut manager = manager();
        let mut a = connect(&mut manager, 1);
        let _b = connect(&mut manager, 2);
        drain(&mut a);

        manager.unregister(2);
        assert_eq!(drain(&mut a), vec![peers(&["peer-7"])]);
        assert_eq!(manager.peer_ids(), vec!["peer-7".to_string()]);

        // unknown connection is a no-op
        manager.unregister(42);
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = manager();
        let _a = connect(&mut manager, 1);
        manager.unregister(1);
        let mut b = connect(&mut manager, 2);
        assert_eq!(drain(&mut b)[0], SignalingEnvelope::PeerAssigned { peer_id: "peer-8".into() });
    }
}
