pub mod bytes;
pub mod client;
pub mod commands;
pub mod cryptography;
pub mod error;
pub mod networking;
pub mod rendezvous;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod utils;

use std::time::Duration;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const CHUNK_SIZE: usize = 16 * 1024;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// How long a sender waits for the recipient to hang up after the last chunk.
pub const SEND_LINGER: Duration = Duration::from_secs(30);

pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";
