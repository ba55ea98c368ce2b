//! # Transport Module
//!
//! The direct peer channel is delegated to a P2P transport library. This
//! module is the seam between it and the session state machine:
//!
//! ## `Connector`
//! Builds a fresh `Transport` for one negotiation. The offering side gets a
//! transport that already owns the `fileTransfer` data channel; the answering
//! side waits for the remote channel to show up.
//!
//! ## `Transport`
//! Offer/answer/candidate creation and application, plus send on the open
//! channel. Everything asynchronous the transport observes (local
//! candidates, channel open/close, inbound messages) comes back as a
//! `TransportNotice` through an `EventSink`.
//!
//! ## Epochs
//! Every transport is stamped with the epoch it was created in. The session
//! bumps its epoch whenever it discards a transport, so late callbacks from
//! an old connection are recognised and ignored.

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::signaling::{IceCandidate, SessionDescription};

pub mod webrtc;

/// Which side of the negotiation a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

/// Negotiation progress as reported by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    /// One data-channel message, text or binary, as raw bytes.
    Message(Vec<u8>),
    ChannelClosed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNotice {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Where a transport reports what happens to it.
#[derive(Debug, Clone)]
pub struct EventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportNotice>,
}

impl EventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TransportNotice>) -> Self {
        EventSink { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn emit(&self, event: TransportEvent) {
        let notice = TransportNotice { epoch: self.epoch, event };
        if self.tx.send(notice).is_err() {
            debug!("Dropping transport event for epoch {}: session is gone", self.epoch);
        }
    }
}

#[async_trait]
pub trait Transport: Send {
    fn negotiation_state(&self) -> NegotiationState;

    /// Create an offer and install it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, TransportError>;

    /// Apply a remote offer and answer it.
    async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), TransportError>;

    async fn add_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Send one binary message on the data channel.
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Send one text message on the data channel.
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

    /// Wait until everything queued on the channel has been handed to the network.
    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self, role: Role, sink: EventSink) -> Result<Self::Transport, TransportError>;
}
