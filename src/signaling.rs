//! Messages exchanged with the rendezvous server.
//!
//! The JSON shapes are discriminated by which fields are present, not by a
//! type tag: `{"peerId": ..}`, `{"peers": [..]}`, `{"action": .., ..}`,
//! `{"offer": .., "target": ..}` and so on. Anything that fits none of them
//! fails to parse and is dropped by whoever receives it.

use serde::{Deserialize, Serialize};

/// Server-assigned identity, valid for one signaling connection.
pub type PeerId = String;

/// Opaque session description produced by the transport (`{"type": "offer", "sdp": ..}`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Opaque connectivity candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Transfer handshake messages, tagged by their `action` field.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action")]
pub enum TransferAction {
    #[serde(rename = "fileTransferRequest")]
    Request { target: PeerId, sender: PeerId },

    #[serde(rename = "fileTransferAck")]
    Ack { target: PeerId },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum SignalingEnvelope {
    PeerAssigned {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    PeerListUpdate {
        peers: Vec<PeerId>,
    },
    Transfer(TransferAction),
    Offer {
        offer: SessionDescription,
        target: PeerId,
    },
    Answer {
        answer: SessionDescription,
        target: PeerId,
    },
    Candidate {
        candidate: IceCandidate,
        target: PeerId,
    },
}

impl SignalingEnvelope {
    pub fn request(target: &str, sender: &str) -> Self {
        SignalingEnvelope::Transfer(TransferAction::Request {
            target: target.to_string(),
            sender: sender.to_string(),
        })
    }

    pub fn ack(target: &str) -> Self {
        SignalingEnvelope::Transfer(TransferAction::Ack {
            target: target.to_string(),
        })
    }

    /// The peer this envelope is addressed to, if any. The server never
    /// looks at this; recipients use it to discard traffic meant for others.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingEnvelope::PeerAssigned { .. } | SignalingEnvelope::PeerListUpdate { .. } => None,
            SignalingEnvelope::Transfer(TransferAction::Request { target, .. })
            | SignalingEnvelope::Transfer(TransferAction::Ack { target })
            | SignalingEnvelope::Offer { target, .. }
            | SignalingEnvelope::Answer { target, .. }
            | SignalingEnvelope::Candidate { target, .. } => Some(target.as_str()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalingEnvelope::PeerAssigned { .. } => "peer-assigned",
            SignalingEnvelope::PeerListUpdate { .. } => "peer-list",
            SignalingEnvelope::Transfer(TransferAction::Request { .. }) => "transfer-request",
            SignalingEnvelope::Transfer(TransferAction::Ack { .. }) => "transfer-ack",
            SignalingEnvelope::Offer { .. } => "offer",
            SignalingEnvelope::Answer { .. } => "answer",
            SignalingEnvelope::Candidate { .. } => "candidate",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> SignalingEnvelope {
        serde_json::from_value(value).expect("should parse envelope")
    }

    #[test]
    fn test_peer_assigned_shape() {
        let env = SignalingEnvelope::PeerAssigned { peer_id: "peer-1".into() };
        assert_eq!(serde_json::to_value(&env).unwrap(), json!({ "peerId": "peer-1" }));
        assert_eq!(parse(json!({ "peerId": "peer-1" })), env);
    }

    #[test]
    fn test_peer_list_shape() {
        let env = parse(json!({ "peers": ["peer-1", "peer-2"] }));
        assert_eq!(
            env,
            SignalingEnvelope::PeerListUpdate { peers: vec!["peer-1".into(), "peer-2".into()] }
        );
    }

    #[test]
    fn test_transfer_request_shape() {
        let env = SignalingEnvelope::request("peer-2", "peer-1");
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({ "action": "fileTransferRequest", "target": "peer-2", "sender": "peer-1" })
        );
        assert_eq!(env.target(), Some("peer-2"));
    }

    #[test]
    fn test_transfer_ack_shape() {
        let env = parse(json!({ "action": "fileTransferAck", "target": "peer-1" }));
        assert_eq!(env, SignalingEnvelope::ack("peer-1"));
    }

    #[test]
    fn test_offer_shape() {
        let env = parse(json!({
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
            "target": "peer-2"
        }));
        match env {
            SignalingEnvelope::Offer { offer, target } => {
                assert_eq!(offer.kind, "offer");
                assert_eq!(target, "peer-2");
            }
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[test]
    fn test_candidate_browser_shape() {
        let env = parse(json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            },
            "target": "peer-1"
        }));
        match env {
            SignalingEnvelope::Candidate { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("expected candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_shapes_rejected() {
        assert!(SignalingEnvelope::from_json("not json").is_err());
        assert!(SignalingEnvelope::from_json(r#"{"hello":"world"}"#).is_err());
        assert!(SignalingEnvelope::from_json(r#"{"action":"dance","target":"peer-1"}"#).is_err());
        assert!(SignalingEnvelope::from_json(r#"{"offer":{"type":"offer","sdp":""}}"#).is_err());
    }
}
