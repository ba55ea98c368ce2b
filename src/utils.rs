use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_SIGNALING_URL, DEFAULT_STUN_SERVER, RECONNECT_DELAY};

/// Contains general purpose utilities for file transfer
/// - Structs that organize data-channel control messages
///     - FileMetadata, announced before the first chunk
///     - ControlMessage, the structured messages interleaved with raw chunks
/// - ClientConfig, the runtime settings handed to a client

/// Packages FileMetadata to send from the sender to the receiver
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
}

/// Structured message on the data channel. Anything that does not parse as
/// one of these is a raw chunk of file bytes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ControlMessage {
    Done { done: bool },
    Metadata(FileMetadata),
}

impl ControlMessage {
    pub fn done() -> Self {
        ControlMessage::Done { done: true }
    }

    /// Try to read a data-channel message as control. `None` means the
    /// message is chunk data.
    pub fn parse(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Runtime settings for a client, built from command line flags.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    pub reconnect_delay: Duration,
    pub output_dir: PathBuf,
    pub auto_accept: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            reconnect_delay: RECONNECT_DELAY,
            output_dir: PathBuf::from("."),
            auto_accept: false,
        }
    }
}
