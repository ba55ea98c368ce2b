//! # Session Module
//!
//! One `Session` drives a transfer with one remote peer at a time:
//!
//! ```text
//! Idle -> RequestSent     -> Negotiating(Offerer)  -> Connected -> Transferring -> Idle
//! Idle -> RequestReceived -> Negotiating(Answerer) -> Connected -> Transferring -> Idle
//!                              any state -> Failed -> Idle
//! ```
//!
//! The session is single-writer: every input (signaling envelope, transport
//! notice, user decision) is applied through `&mut self` by the task that
//! owns it. Outputs go through an `Outbox`: envelopes for the rendezvous
//! server and `SessionEvent`s for whoever presents progress to the user.
//!
//! Failure handling follows three rules:
//! - out-of-order or duplicate handshake traffic is logged and ignored
//! - negotiation failures and channel failures reset the session to Idle
//! - nothing is retried; the user starts a new transfer from Idle

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::bytes::{chunk_count, split_chunks, Reassembler};
use crate::error::{ChannelError, NegotiationError, SessionError, TransferStateError};
use crate::signaling::{IceCandidate, PeerId, SessionDescription, SignalingEnvelope, TransferAction};
use crate::transport::{
    Connector, EventSink, NegotiationState, Role, Transport, TransportEvent, TransportNotice,
};
use crate::utils::{ControlMessage, FileMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    RequestSent { remote: PeerId },
    RequestReceived { remote: PeerId },
    Negotiating { remote: PeerId, role: Role },
    Connected { remote: PeerId, role: Role },
    Transferring { remote: PeerId, role: Role },
    Failed,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::RequestSent { .. } => "request-sent",
            Phase::RequestReceived { .. } => "request-received",
            Phase::Negotiating { .. } => "negotiating",
            Phase::Connected { .. } => "connected",
            Phase::Transferring { .. } => "transferring",
            Phase::Failed => "failed",
        }
    }

    pub fn remote(&self) -> Option<&PeerId> {
        match self {
            Phase::Idle | Phase::Failed => None,
            Phase::RequestSent { remote }
            | Phase::RequestReceived { remote }
            | Phase::Negotiating { remote, .. }
            | Phase::Connected { remote, .. }
            | Phase::Transferring { remote, .. } => Some(remote),
        }
    }

    fn role(&self) -> Option<Role> {
        match self {
            Phase::Negotiating { role, .. }
            | Phase::Connected { role, .. }
            | Phase::Transferring { role, .. } => Some(*role),
            _ => None,
        }
    }
}

/// What the session reports to the user-facing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered { peer_id: PeerId },
    Peers { peers: Vec<PeerId> },
    IncomingRequest { from: PeerId },
    ChannelOpen { remote: PeerId },
    Started { role: Role, metadata: Option<FileMetadata> },
    Progress { role: Role, bytes: u64, total: Option<u64> },
    Sent { metadata: FileMetadata },
    Received { metadata: Option<FileMetadata>, data: Vec<u8> },
    /// The remote side closed the channel of a transfer that already finished.
    PeerClosed { remote: PeerId },
    Failed { reason: String },
}

/// A file queued for sending once the channel opens.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub metadata: FileMetadata,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let metadata = FileMetadata {
            name: name.into(),
            size: data.len() as u64,
        };
        OutgoingFile { metadata, data }
    }
}

#[derive(Debug, Clone)]
pub struct Outbox {
    signaling: mpsc::UnboundedSender<SignalingEnvelope>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Outbox {
    pub fn new(
        signaling: mpsc::UnboundedSender<SignalingEnvelope>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Outbox { signaling, events }
    }

    pub fn signal(&self, envelope: SignalingEnvelope) {
        debug!("Queueing {} envelope for {:?}", envelope.kind(), envelope.target());
        if self.signaling.send(envelope).is_err() {
            warn!("Signaling link is gone, envelope dropped");
        }
    }

    pub fn event(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Nobody is listening for session events");
        }
    }
}

/// Transport of a finished send, kept open until the receiver hangs up so
/// the tail of the file is not cut off. Its epoch is never the live one.
struct Retired<T> {
    epoch: u64,
    remote: PeerId,
    transport: T,
}

pub struct Session<C: Connector> {
    connector: C,
    outbox: Outbox,
    notices: mpsc::UnboundedSender<TransportNotice>,
    local_id: Option<PeerId>,
    phase: Phase,
    in_flight: bool,
    transport: Option<C::Transport>,
    retired: Option<Retired<C::Transport>>,
    epoch: u64,
    outgoing: Option<OutgoingFile>,
    incoming: Reassembler,
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C, outbox: Outbox, notices: mpsc::UnboundedSender<TransportNotice>) -> Self {
        Session {
            connector,
            outbox,
            notices,
            local_id: None,
            phase: Phase::Idle,
            in_flight: false,
            transport: None,
            retired: None,
            epoch: 0,
            outgoing: None,
            incoming: Reassembler::new(),
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn set_local_id(&mut self, peer_id: PeerId) {
        info!("Assigned peer id: {}", peer_id);
        self.local_id = Some(peer_id);
    }

    fn is_me(&self, target: &str) -> bool {
        self.local_id.as_deref() == Some(target)
    }

    // ========================================================================
    // User actions
    // ========================================================================

    /// Ask `target` to accept a file. The file is held until the channel opens.
    pub fn request_transfer(&mut self, target: PeerId, file: OutgoingFile) -> Result<(), TransferStateError> {
        let sender = self.local_id.clone().ok_or(TransferStateError::Unassigned)?;
        if self.in_flight || self.phase != Phase::Idle {
            return Err(TransferStateError::Busy(self.phase.name()));
        }

        info!("Requesting transfer of {} ({} bytes) to {}", file.metadata.name, file.metadata.size, target);
        self.outbox.signal(SignalingEnvelope::request(&target, &sender));
        self.in_flight = true;
        self.outgoing = Some(file);
        self.phase = Phase::RequestSent { remote: target };
        Ok(())
    }

    pub fn accept(&mut self) -> Result<(), TransferStateError> {
        let Phase::RequestReceived { remote } = &self.phase else {
            return Err(TransferStateError::NoPendingRequest);
        };
        let remote = remote.clone();

        info!("Accepted transfer from {}", remote);
        self.in_flight = true;
        self.outbox.signal(SignalingEnvelope::ack(&remote));
        self.phase = Phase::Negotiating { remote, role: Role::Answerer };
        Ok(())
    }

    pub fn decline(&mut self) -> Result<(), TransferStateError> {
        let Phase::RequestReceived { remote } = &self.phase else {
            return Err(TransferStateError::NoPendingRequest);
        };

        info!("Declined transfer from {}", remote);
        self.phase = Phase::Idle;
        Ok(())
    }

    /// Abort whatever is running because the signaling link went away.
    pub async fn abort(&mut self, reason: ChannelError) {
        if self.phase == Phase::Idle && !self.in_flight {
            return;
        }
        self.reset(&reason.to_string()).await;
    }

    /// Abort anything running and close every transport, including one
    /// still draining a finished send.
    pub async fn shutdown(&mut self) {
        self.abort(ChannelError::Closed).await;
        self.close_retired().await;
    }

    // ========================================================================
    // Signaling input
    // ========================================================================

    /// Apply one envelope relayed by the rendezvous server. Errors have
    /// already been acted on when this returns; they are handed back so the
    /// caller can log them.
    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) -> Result<(), SessionError> {
        let result = self.dispatch(envelope).await;
        if let Err(err) = &result {
            self.recover(err).await;
        }
        result
    }

    async fn dispatch(&mut self, envelope: SignalingEnvelope) -> Result<(), SessionError> {
        if let Some(target) = envelope.target() {
            if !self.is_me(target) {
                debug!("Ignoring {} addressed to {}", envelope.kind(), target);
                return Ok(());
            }
        }

        match envelope {
            SignalingEnvelope::PeerAssigned { peer_id } => {
                self.set_local_id(peer_id);
                Ok(())
            }
            SignalingEnvelope::PeerListUpdate { .. } => Ok(()),
            SignalingEnvelope::Transfer(TransferAction::Request { sender, .. }) => {
                self.on_request(sender)
            }
            SignalingEnvelope::Transfer(TransferAction::Ack { .. }) => self.on_ack().await,
            SignalingEnvelope::Offer { offer, .. } => self.on_offer(offer).await,
            SignalingEnvelope::Answer { answer, .. } => self.on_answer(answer).await,
            SignalingEnvelope::Candidate { candidate, .. } => self.on_candidate(candidate).await,
        }
    }

    fn on_request(&mut self, sender: PeerId) -> Result<(), SessionError> {
        if self.in_flight || self.phase != Phase::Idle {
            return Err(TransferStateError::DuplicateRequest(sender).into());
        }

        info!("Received transfer request from {}", sender);
        self.phase = Phase::RequestReceived { remote: sender.clone() };
        self.outbox.event(SessionEvent::IncomingRequest { from: sender });
        Ok(())
    }

    async fn on_ack(&mut self) -> Result<(), SessionError> {
        let Phase::RequestSent { remote } = &self.phase else {
            return Err(TransferStateError::UnexpectedAck.into());
        };
        let remote = remote.clone();

        info!("{} accepted, creating offer", remote);
        self.phase = Phase::Negotiating { remote: remote.clone(), role: Role::Offerer };

        let transport = self.open_transport(Role::Offerer).await?;
        let offer = transport
            .create_offer()
            .await
            .map_err(|source| NegotiationError::Transport { stage: "create offer", source })?;

        self.outbox.signal(SignalingEnvelope::Offer { offer, target: remote });
        Ok(())
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), SessionError> {
        let Phase::Negotiating { remote, role: Role::Answerer } = &self.phase else {
            return Err(TransferStateError::UnexpectedOffer.into());
        };
        let remote = remote.clone();
        let me = self.local_id.clone().ok_or(TransferStateError::Unassigned)?;

        let transport = self.open_transport(Role::Answerer).await?;
        let answer = transport
            .accept_offer(offer)
            .await
            .map_err(|source| NegotiationError::Transport { stage: "answer offer", source })?;

        debug!("Answering offer from {}", remote);
        self.outbox.signal(SignalingEnvelope::Answer { answer, target: remote });
        self.outbox.signal(SignalingEnvelope::ack(&me));
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Negotiating { role: Role::Offerer, .. }) {
            return Err(TransferStateError::StaleAnswer.into());
        }
        let transport = match self.transport.as_mut() {
            Some(t) if t.negotiation_state() == NegotiationState::HaveLocalOffer => t,
            _ => return Err(TransferStateError::StaleAnswer.into()),
        };

        transport
            .apply_answer(answer)
            .await
            .map_err(|source| NegotiationError::Transport { stage: "apply answer", source })?;
        debug!("Answer applied");
        Ok(())
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) -> Result<(), SessionError> {
        let transport = self.transport.as_mut().ok_or(NegotiationError::NoContext)?;
        transport
            .add_candidate(candidate)
            .await
            .map_err(|source| NegotiationError::Transport { stage: "add candidate", source })?;
        Ok(())
    }

    async fn open_transport(&mut self, role: Role) -> Result<&mut C::Transport, SessionError> {
        if let Some(mut old) = self.transport.take() {
            old.close().await;
        }
        self.close_retired().await;

        self.epoch += 1;
        let sink = EventSink::new(self.epoch, self.notices.clone());
        let transport = self
            .connector
            .connect(role, sink)
            .await
            .map_err(|source| NegotiationError::Transport { stage: "create connection", source })?;

        Ok(self.transport.insert(transport))
    }

    // ========================================================================
    // Transport input
    // ========================================================================

    pub async fn handle_transport(&mut self, notice: TransportNotice) -> Result<(), SessionError> {
        if self.retired.as_ref().is_some_and(|r| r.epoch == notice.epoch) {
            self.on_retired_event(notice.event).await;
            return Ok(());
        }
        if notice.epoch != self.epoch || self.transport.is_none() {
            debug!("Ignoring stale transport event from epoch {}", notice.epoch);
            return Ok(());
        }

        let result = match notice.event {
            TransportEvent::LocalCandidate(candidate) => {
                self.on_local_candidate(candidate);
                Ok(())
            }
            TransportEvent::ChannelOpen => self.on_channel_open().await,
            TransportEvent::Message(data) => self.on_channel_message(&data).await,
            TransportEvent::ChannelClosed => Err(ChannelError::Closed.into()),
            TransportEvent::Failed(reason) => {
                Err(ChannelError::Transport(crate::error::TransportError(reason)).into())
            }
        };

        if let Err(err) = &result {
            self.recover(err).await;
        }
        result
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) {
        match self.phase.remote() {
            Some(remote) => {
                let target = remote.clone();
                self.outbox.signal(SignalingEnvelope::Candidate { candidate, target });
            }
            None => debug!("Dropping local candidate, no remote peer"),
        }
    }

    async fn on_channel_open(&mut self) -> Result<(), SessionError> {
        let Phase::Negotiating { remote, role } = &self.phase else {
            debug!("Channel opened while {}", self.phase.name());
            return Ok(());
        };
        let (remote, role) = (remote.clone(), *role);

        info!("Channel to {} is open", remote);
        self.phase = Phase::Connected { remote: remote.clone(), role };
        self.outbox.event(SessionEvent::ChannelOpen { remote });

        if role == Role::Offerer {
            self.send_outgoing().await?;
        }
        Ok(())
    }

    async fn on_retired_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelClosed | TransportEvent::Failed(_) => {
                if let Some(retired) = self.retired.take() {
                    debug!("{} closed the channel of the finished transfer", retired.remote);
                    let Retired { remote, mut transport, .. } = retired;
                    transport.close().await;
                    self.outbox.event(SessionEvent::PeerClosed { remote });
                }
            }
            other => debug!("Ignoring {:?} from a finished transfer", other),
        }
    }

    async fn close_retired(&mut self) {
        if let Some(mut retired) = self.retired.take() {
            retired.transport.close().await;
        }
    }

    // ========================================================================
    // Chunked transfer
    // ========================================================================

    async fn send_outgoing(&mut self) -> Result<(), SessionError> {
        let Some(remote) = self.phase.remote().cloned() else {
            return Ok(());
        };
        let Some(file) = self.outgoing.take() else {
            warn!("Channel open but nothing queued to send");
            return Ok(());
        };
        let transport = self.transport.as_mut().ok_or(ChannelError::Closed)?;

        debug!(
            "Sending {} in {} chunks",
            file.metadata.name,
            chunk_count(file.metadata.size)
        );
        self.phase = Phase::Transferring { remote: remote.clone(), role: Role::Offerer };
        self.outbox.event(SessionEvent::Started {
            role: Role::Offerer,
            metadata: Some(file.metadata.clone()),
        });

        let metadata = serde_json::to_string(&ControlMessage::Metadata(file.metadata.clone()))
            .map_err(ChannelError::Encode)?;
        transport.send_text(&metadata).await.map_err(ChannelError::Transport)?;

        let mut sent: u64 = 0;
        for chunk in split_chunks(&file.data) {
            transport.send(chunk).await.map_err(ChannelError::Transport)?;
            sent += chunk.len() as u64;
            self.outbox.event(SessionEvent::Progress {
                role: Role::Offerer,
                bytes: sent,
                total: Some(file.metadata.size),
            });
        }

        let done = serde_json::to_string(&ControlMessage::done()).map_err(ChannelError::Encode)?;
        transport.send_text(&done).await.map_err(ChannelError::Transport)?;
        transport.flush().await.map_err(ChannelError::Transport)?;

        info!("Sent {} ({} bytes)", file.metadata.name, sent);
        if let Some(transport) = self.transport.take() {
            self.retired = Some(Retired { epoch: self.epoch, remote, transport });
        }
        self.epoch += 1;
        self.finish_transfer();
        self.outbox.event(SessionEvent::Sent { metadata: file.metadata });
        Ok(())
    }

    async fn on_channel_message(&mut self, data: &[u8]) -> Result<(), SessionError> {
        let Some(role) = self.phase.role() else {
            warn!("Dropping {} byte channel message while {}", data.len(), self.phase.name());
            return Ok(());
        };
        if matches!(self.phase, Phase::Negotiating { .. }) {
            warn!("Dropping {} byte channel message before the channel opened", data.len());
            return Ok(());
        }

        match ControlMessage::parse(data) {
            Some(ControlMessage::Done { done: true }) => self.complete_incoming().await,
            Some(ControlMessage::Done { done: false }) => debug!("Ignoring done:false control message"),
            Some(ControlMessage::Metadata(metadata)) => {
                info!("Incoming file {} ({} bytes)", metadata.name, metadata.size);
                self.enter_transferring(role);
                self.outbox.event(SessionEvent::Started { role, metadata: Some(metadata.clone()) });
                self.incoming.set_metadata(metadata);
            }
            None => {
                if !matches!(self.phase, Phase::Transferring { .. }) {
                    self.enter_transferring(role);
                    self.outbox.event(SessionEvent::Started { role, metadata: None });
                }
                let bytes = self.incoming.push(data);
                let total = self.incoming.metadata().map(|m| m.size);
                self.outbox.event(SessionEvent::Progress { role, bytes, total });
            }
        }
        Ok(())
    }

    fn enter_transferring(&mut self, role: Role) {
        if let Some(remote) = self.phase.remote().cloned() {
            self.phase = Phase::Transferring { remote, role };
        }
    }

    async fn complete_incoming(&mut self) {
        let metadata = self.incoming.metadata().cloned();
        let received = self.incoming.received();

        match &metadata {
            Some(m) if m.size != received => warn!(
                "Received {} bytes but {} was announced as {} bytes",
                received,
                m.name,
                m.size
            ),
            _ => info!(
                "Transfer complete: {} bytes in {} chunks",
                received,
                self.incoming.chunk_count()
            ),
        }
        let data = self.incoming.finish();

        // the sender keeps its end open until we hang up
        self.epoch += 1;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.finish_transfer();
        self.outbox.event(SessionEvent::Received { metadata, data });
    }

    fn finish_transfer(&mut self) {
        self.in_flight = false;
        self.outgoing = None;
        self.phase = Phase::Idle;
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    async fn recover(&mut self, err: &SessionError) {
        match err {
            SessionError::TransferState(e) => warn!("{}", e),
            SessionError::Negotiation(NegotiationError::NoContext) => {
                error!("Dropping candidate: no negotiation in progress")
            }
            SessionError::Negotiation(e) => {
                error!("Negotiation failed: {}", e);
                self.reset(&e.to_string()).await;
            }
            SessionError::Channel(e) => {
                error!("Transfer failed: {}", e);
                self.reset(&e.to_string()).await;
            }
        }
    }

    /// Tear everything down and return to Idle. Reachable from every
    /// failure path, so the in-flight flag can never outlive a transfer.
    async fn reset(&mut self, reason: &str) {
        self.phase = Phase::Failed;
        self.in_flight = false;
        self.outgoing = None;
        self.incoming.clear();
        self.epoch += 1;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.close_retired().await;

        self.outbox.event(SessionEvent::Failed { reason: reason.to_string() });
        self.phase = Phase::Idle;
    }
}
