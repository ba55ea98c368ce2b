//! `Transport` backed by the `webrtc` crate: one peer connection carrying a
//! single ordered, reliable data channel labelled `fileTransfer`.
//!
//! Candidates are trickled: every local candidate is reported as soon as the
//! ICE agent finds it and goes out as its own signaling envelope.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ::bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use super::{Connector, EventSink, NegotiationState, Role, Transport, TransportEvent};
use crate::error::TransportError;
use crate::signaling::{IceCandidate, SessionDescription};
use crate::DATA_CHANNEL_LABEL;

/// Most bytes a send may leave queued in the SCTP buffer.
const BUFFERED_HIGH: usize = 1024 * 1024;
const DRAIN_POLL: Duration = Duration::from_millis(10);
/// A drain fails only when the buffer has not shrunk for this long.
const DRAIN_STALL: Duration = Duration::from_secs(15);

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

pub struct WebRtcConnector {
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        WebRtcConnector { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    type Transport = WebRtcTransport;

    async fn connect(&self, role: Role, sink: EventSink) -> Result<WebRtcTransport, TransportError> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(self.configuration()).await?);
        debug!("Created peer connection as {:?} (epoch {})", role, sink.epoch());

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => info!("Peer connection established"),
                    RTCPeerConnectionState::Failed => {
                        sink.emit(TransportEvent::Failed("peer connection failed".to_string()))
                    }
                    other => debug!("Peer connection state: {}", other),
                }
            })
        }));

        let channel: ChannelSlot = Arc::new(Mutex::new(None));

        match role {
            Role::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc.create_data_channel(DATA_CHANNEL_LABEL, Some(init)).await?;
                attach_channel_handlers(&dc, &sink);
                *channel.lock().await = Some(dc);
            }
            Role::Answerer => {
                let slot = channel.clone();
                let dc_sink = sink.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let sink = dc_sink.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            warn!("Ignoring unexpected data channel '{}'", dc.label());
                            return;
                        }
                        debug!("Remote opened data channel '{}'", dc.label());
                        attach_channel_handlers(&dc, &sink);
                        *slot.lock().await = Some(dc);
                    })
                }));
            }
        }

        Ok(WebRtcTransport { pc, channel })
    }
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, sink: &EventSink) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        Box::pin(async move {
            info!("Data channel open");
            sink.emit(TransportEvent::ChannelOpen);
        })
    }));

    let message_sink = sink.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = message_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::Message(msg.data.to_vec()));
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            info!("Data channel closed");
            sink.emit(TransportEvent::ChannelClosed);
        })
    }));

    let error_sink = sink.clone();
    dc.on_error(Box::new(move |err: webrtc::Error| {
        let sink = error_sink.clone();
        Box::pin(async move {
            sink.emit(TransportEvent::Failed(err.to_string()));
        })
    }));
}

async fn buffered(dc: Arc<RTCDataChannel>) -> Result<usize, TransportError> {
    let state = dc.ready_state();
    if state != RTCDataChannelState::Open {
        return Err(TransportError(format!("data channel is {:?}", state)));
    }
    Ok(dc.buffered_amount().await)
}

/// Wait until `buffered` reports at most `limit` bytes. The deadline moves
/// forward whenever the amount reaches a new low, so a slow link that keeps
/// draining never times out.
async fn wait_for_drain<F, Fut>(
    limit: usize,
    stall: Duration,
    poll: Duration,
    mut buffered: F,
) -> Result<(), TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, TransportError>>,
{
    let mut pending = buffered().await?;
    if pending <= limit {
        return Ok(());
    }
    debug!("Waiting for {} buffered bytes to drain below {}", pending, limit);

    let mut lowest = pending;
    let mut deadline = Instant::now() + stall;
    loop {
        sleep(poll).await;
        pending = buffered().await?;
        if pending <= limit {
            return Ok(());
        }
        if pending < lowest {
            lowest = pending;
            deadline = Instant::now() + stall;
        } else if Instant::now() >= deadline {
            return Err(TransportError(format!(
                "send buffer stuck at {} bytes for {:?}",
                pending, stall
            )));
        }
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    channel: ChannelSlot,
}

impl WebRtcTransport {
    async fn data_channel(&self) -> Result<Arc<RTCDataChannel>, TransportError> {
        self.channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError("data channel is not open".to_string()))
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn negotiation_state(&self) -> NegotiationState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable => NegotiationState::Stable,
            RTCSignalingState::HaveLocalOffer => NegotiationState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => NegotiationState::HaveRemoteOffer,
            RTCSignalingState::Closed => NegotiationState::Closed,
            _ => NegotiationState::Other,
        }
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription {
            kind: "offer".to_string(),
            sdp: offer.sdp,
        })
    }

    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        let remote = RTCSessionDescription::offer(offer.sdp)?;
        self.pc.set_remote_description(remote).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription {
            kind: "answer".to_string(),
            sdp: answer.sdp,
        })
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), TransportError> {
        let remote = RTCSessionDescription::answer(answer.sdp)?;
        self.pc.set_remote_description(remote).await?;
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let dc = self.data_channel().await?;
        let limit = BUFFERED_HIGH.saturating_sub(data.len());
        wait_for_drain(limit, DRAIN_STALL, DRAIN_POLL, || buffered(dc.clone())).await?;
        dc.send(&Bytes::copy_from_slice(data)).await?;
        Ok(())
    }

    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        let dc = self.data_channel().await?;
        let limit = BUFFERED_HIGH.saturating_sub(text.len());
        wait_for_drain(limit, DRAIN_STALL, DRAIN_POLL, || buffered(dc.clone())).await?;
        dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let dc = self.data_channel().await?;
        wait_for_drain(0, DRAIN_STALL, DRAIN_POLL, || buffered(dc.clone())).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.pc.close().await {
            warn!("Failed to close peer connection: {}", e);
        }
    }
}
