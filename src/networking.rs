use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::ConnectionError;
use crate::signaling::SignalingEnvelope;

type SignalingStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the signaling link reports to the client loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Envelope(SignalingEnvelope),
    Disconnected,
}

/// Keep a websocket to the rendezvous server open for as long as the client
/// wants one.
///
/// Every envelope received from `outbound` is serialized and sent. Every
/// text frame from the server that parses as an envelope is forwarded to
/// `inbound`. When the link drops the client gets `LinkEvent::Disconnected`
/// and the link is re-established after `reconnect_delay`, forever.
/// A fresh connection is a fresh registration: the server hands out a new
/// peer id, which arrives as an ordinary `PeerAssigned` envelope.
///
/// Returns once `outbound` is closed or nobody listens on `inbound`.
pub async fn run_signaling_link(
    url: String,
    reconnect_delay: Duration,
    mut outbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        debug!("Connecting to signaling server at {}", url);
        match connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!("Connected to signaling server at {}", url);
                if inbound.send(LinkEvent::Connected).is_err() {
                    return;
                }

                match pump(stream, &mut outbound, &inbound).await {
                    Ok(()) => {
                        debug!("Signaling link shut down");
                        return;
                    }
                    Err(e) => warn!("Signaling connection lost: {}", e),
                }

                if inbound.send(LinkEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(e) => error!("Failed to connect to signaling server: {}", e),
        }

        // envelopes queued for the old connection are meaningless to the next one
        loop {
            match outbound.try_recv() {
                Ok(envelope) => debug!("Dropping queued {} envelope", envelope.kind()),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
    }
}

/// Shuttle envelopes both ways until the connection fails. `Ok` means the
/// client side went away and the link should stop.
async fn pump(
    stream: SignalingStream,
    outbound: &mut mpsc::UnboundedReceiver<SignalingEnvelope>,
    inbound: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), ConnectionError> {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = read.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ConnectionError::Closed),
                };

                match message {
                    Message::Text(text) => match SignalingEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            debug!("Received {} envelope", envelope.kind());
                            if inbound.send(LinkEvent::Envelope(envelope)).is_err() {
                                let _ = write.close().await;
                                return Ok(());
                            }
                        }
                        Err(e) => warn!("Dropping unparseable signaling message: {}", e),
                    },
                    Message::Close(_) => return Err(ConnectionError::Closed),
                    Message::Binary(data) => {
                        warn!("Dropping {} byte binary signaling frame", data.len())
                    }
                    _ => {}
                }
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    let _ = write.close().await;
                    return Ok(());
                };
                let text = envelope.to_json()?;
                debug!("Sending {} envelope", envelope.kind());
                write.send(Message::Text(text)).await?;
            }
        }
    }
}
