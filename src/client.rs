//! # Client Module
//!
//! Wires one `Session` to the outside world. A single task owns the session
//! and selects over three inputs:
//! - `LinkEvent`s from the signaling link (`networking`)
//! - `TransportNotice`s from whatever transport the session created
//! - `Command`s from the user-facing side (`commands::send` / `commands::receive`)
//!
//! Because only this task touches the session, its state never needs a lock.

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::networking::{run_signaling_link, LinkEvent};
use crate::session::{Outbox, OutgoingFile, Session, SessionEvent};
use crate::signaling::{PeerId, SignalingEnvelope};
use crate::transport::webrtc::WebRtcConnector;
use crate::transport::Connector;
use crate::utils::ClientConfig;

#[derive(Debug)]
pub enum Command {
    Send { target: PeerId, file: OutgoingFile },
    Accept,
    Decline,
    Shutdown,
}

/// Handle held by the user-facing side of a running client.
pub struct ClientHandle {
    pub commands: mpsc::UnboundedSender<Command>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Start a client that talks to the rendezvous server in `config` and
/// negotiates peer connections over WebRTC.
pub fn spawn(config: ClientConfig) -> ClientHandle {
    let connector = WebRtcConnector::new(config.ice_servers.clone());
    spawn_with(config, connector)
}

pub fn spawn_with<C>(config: ClientConfig, connector: C) -> ClientHandle
where
    C: Connector + 'static,
    C::Transport: 'static,
{
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    tokio::spawn(run_signaling_link(
        config.signaling_url.clone(),
        config.reconnect_delay,
        signal_rx,
        link_tx,
    ));
    tokio::spawn(run_client(connector, signal_tx, event_tx, link_rx, command_rx));

    ClientHandle { commands: command_tx, events }
}

async fn run_client<C: Connector>(
    connector: C,
    signal_tx: mpsc::UnboundedSender<SignalingEnvelope>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    mut link: mpsc::UnboundedReceiver<LinkEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (notice_tx, mut notices) = mpsc::unbounded_channel();
    let outbox = Outbox::new(signal_tx, event_tx);
    let mut session = Session::new(connector, outbox.clone(), notice_tx);

    loop {
        tokio::select! {
            event = link.recv() => {
                let Some(event) = event else {
                    debug!("Signaling link stopped");
                    break;
                };
                on_link_event(&mut session, &outbox, event).await;
            }
            Some(notice) = notices.recv() => {
                if let Err(e) = session.handle_transport(notice).await {
                    debug!("Transport event rejected: {}", e);
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Send { target, file }) => {
                        if let Err(e) = session.request_transfer(target, file) {
                            warn!("Cannot start transfer: {}", e);
                            outbox.event(SessionEvent::Failed { reason: e.to_string() });
                        }
                    }
                    Some(Command::Accept) => {
                        if let Err(e) = session.accept() {
                            warn!("{}", e);
                        }
                    }
                    Some(Command::Decline) => {
                        if let Err(e) = session.decline() {
                            warn!("{}", e);
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!("Client shutting down");
                        session.shutdown().await;
                        break;
                    }
                }
            }
        }
    }
}

async fn on_link_event<C: Connector>(session: &mut Session<C>, outbox: &Outbox, event: LinkEvent) {
    match event {
        LinkEvent::Connected => debug!("Waiting for peer id"),
        LinkEvent::Disconnected => session.abort(ChannelError::SignalingLost).await,
        LinkEvent::Envelope(SignalingEnvelope::PeerAssigned { peer_id }) => {
            session.set_local_id(peer_id.clone());
            outbox.event(SessionEvent::Registered { peer_id });
        }
        LinkEvent::Envelope(SignalingEnvelope::PeerListUpdate { peers }) => {
            let me = session.local_id().cloned();
            let peers: Vec<PeerId> = peers.into_iter().filter(|p| Some(p) != me.as_ref()).collect();
            debug!("Peers online: {:?}", peers);
            outbox.event(SessionEvent::Peers { peers });
        }
        LinkEvent::Envelope(envelope) => {
            if let Err(e) = session.handle_envelope(envelope).await {
                debug!("Envelope rejected: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::RendezvousServer;
    use crate::transport::mock::MockConnector;
    use std::time::Duration;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// A client loop fed by hand instead of by a websocket.
    struct Running {
        link: UnboundedSender<LinkEvent>,
        commands: UnboundedSender<Command>,
        signals: UnboundedReceiver<SignalingEnvelope>,
        events: UnboundedReceiver<SessionEvent>,
        connector: MockConnector,
        task: JoinHandle<()>,
    }

    impl Running {
        fn start() -> Self {
            let connector = MockConnector::default();
            let (signal_tx, signals) = mpsc::unbounded_channel();
            let (event_tx, events) = mpsc::unbounded_channel();
            let (link, link_rx) = mpsc::unbounded_channel();
            let (commands, command_rx) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_client(connector.clone(), signal_tx, event_tx, link_rx, command_rx));
            Running { link, commands, signals, events, connector, task }
        }

        fn deliver(&self, envelope: SignalingEnvelope) {
            self.link.send(LinkEvent::Envelope(envelope)).unwrap();
        }

        async fn next_event(&mut self) -> SessionEvent {
            timeout(WAIT, self.events.recv()).await.expect("Timed out").expect("Client stopped")
        }

        async fn next_signal(&mut self) -> SignalingEnvelope {
            timeout(WAIT, self.signals.recv()).await.expect("Timed out").expect("Client stopped")
        }

        /// Skip events until one matches.
        async fn wait_for(&mut self, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
            loop {
                let event = self.next_event().await;
                if wanted(&event) {
                    return event;
                }
            }
        }

        async fn register(&mut self, id: &str) {
            self.link.send(LinkEvent::Connected).unwrap();
            self.deliver(SignalingEnvelope::PeerAssigned { peer_id: id.to_string() });
            assert_eq!(self.next_event().await, SessionEvent::Registered { peer_id: id.to_string() });
        }

        fn send_file(&self, target: &str) {
            let file = OutgoingFile::new("notes.txt", b"hello".to_vec());
            self.commands.send(Command::Send { target: target.to_string(), file }).unwrap();
        }
    }

    // ============================================================================
    // Client Loop Tests
    // ============================================================================

    #[tokio::test]
    async fn test_peer_list_drops_own_id() {
        let mut client = Running::start();
        client.register("peer-1").await;

        client.deliver(SignalingEnvelope::PeerListUpdate {
            peers: vec!["peer-1".into(), "peer-2".into(), "peer-3".into()],
        });
        assert_eq!(
            client.next_event().await,
            SessionEvent::Peers { peers: vec!["peer-2".into(), "peer-3".into()] }
        );
    }

    #[tokio::test]
    async fn test_disconnect_aborts_transfer_and_clears_flag() {
        let mut client = Running::start();
        client.register("peer-1").await;

        client.send_file("peer-2");
        assert_eq!(client.next_signal().await, SignalingEnvelope::request("peer-2", "peer-1"));
        client.deliver(SignalingEnvelope::ack("peer-1"));
        assert!(matches!(client.next_signal().await, SignalingEnvelope::Offer { .. }));

        client.link.send(LinkEvent::Disconnected).unwrap();
        client.wait_for(|e| matches!(e, SessionEvent::Failed { .. })).await;
        assert_eq!(client.connector.log.lock().unwrap().closed, 1);

        // the same session takes a new transfer once the link is back
        client.link.send(LinkEvent::Connected).unwrap();
        client.send_file("peer-2");
        assert_eq!(client.next_signal().await, SignalingEnvelope::request("peer-2", "peer-1"));
    }

    #[tokio::test]
    async fn test_send_while_busy_reports_failure() {
        let mut client = Running::start();
        client.register("peer-1").await;

        client.send_file("peer-2");
        assert_eq!(client.next_signal().await, SignalingEnvelope::request("peer-2", "peer-1"));

        client.send_file("peer-3");
        match client.next_event().await {
            SessionEvent::Failed { reason } => assert!(reason.contains("busy"), "{}", reason),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(client.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_before_registration_reports_failure() {
        let mut client = Running::start();
        client.send_file("peer-2");
        match client.next_event().await {
            SessionEvent::Failed { reason } => assert!(reason.contains("peer id"), "{}", reason),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let client = Running::start();
        client.commands.send(Command::Shutdown).unwrap();
        timeout(WAIT, client.task).await.expect("Client did not stop").unwrap();
    }

    #[tokio::test]
    async fn test_spawn_with_registers_against_server() {
        let server = RendezvousServer::bind("127.0.0.1:0").await.unwrap().with_first_peer_number(40);
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let config = ClientConfig {
            signaling_url: format!("ws://{}", addr),
            reconnect_delay: Duration::from_millis(100),
            ..ClientConfig::default()
        };
        let mut handle = spawn_with(config, MockConnector::default());

        let registered = timeout(WAIT, handle.events.recv()).await.unwrap().unwrap();
        assert_eq!(registered, SessionEvent::Registered { peer_id: "peer-40".into() });
        let peers = timeout(WAIT, handle.events.recv()).await.unwrap().unwrap();
        assert_eq!(peers, SessionEvent::Peers { peers: vec![] });

        handle.commands.send(Command::Shutdown).unwrap();
    }
}
