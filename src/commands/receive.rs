use std::error::Error;
use std::path::PathBuf;

use indicatif::ProgressBar;
use log::{debug, info, warn};

use crate::bytes::write_artifact;
use crate::client::{self, Command};
use crate::commands::{byte_progress_bar, confirm};
use crate::cryptography::{decode_key, decrypt_file};
use crate::session::SessionEvent;
use crate::utils::ClientConfig;
use crate::KEY_SIZE;

/// Wait for one incoming file, then write it as `<out>/received_<name>`.
///
/// With a key the reassembled bytes are decrypted first. A wrong key or a
/// corrupted payload is reported and nothing is written.
pub async fn run(key: Option<String>, config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let key: Option<[u8; KEY_SIZE]> = key.as_deref().map(decode_key).transpose()?;
    let output_dir: PathBuf = config.output_dir.clone();
    let auto_accept = config.auto_accept;

    let mut handle = client::spawn(config);
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Registered { peer_id } => {
                println!("Connected as \x1b[1m{}\x1b[0m, waiting for a file", peer_id)
            }
            SessionEvent::Peers { peers } => debug!("Peers: {:?}", peers),
            SessionEvent::IncomingRequest { from } => {
                let accepted = auto_accept || confirm(format!("Accept a file from {}?", from)).await?;
                let command = if accepted { Command::Accept } else { Command::Decline };
                handle.commands.send(command)?;
            }
            SessionEvent::ChannelOpen { remote } => info!("Connected to {}", remote),
            SessionEvent::Started { metadata, .. } => {
                let total = metadata.as_ref().map(|m| m.size).unwrap_or_default();
                let bar = bar.get_or_insert_with(|| byte_progress_bar(total));
                bar.set_length(total);
                if let Some(metadata) = metadata {
                    bar.set_message(metadata.name);
                }
            }
            SessionEvent::Progress { bytes, .. } => {
                if let Some(bar) = &bar {
                    bar.set_position(bytes);
                }
            }
            SessionEvent::Received { metadata, data } => {
                if let Some(bar) = bar.take() {
                    bar.finish_with_message("Download complete!");
                }
                let _ = handle.commands.send(Command::Shutdown);

                let data = match &key {
                    Some(key) => decrypt_file(key, &data)?,
                    None => data,
                };
                let name = metadata.map(|m| m.name).unwrap_or_else(|| "file".to_string());
                let path = write_artifact(&output_dir, "received_", &name, &data).await?;
                println!("File saved: {}", path.display());
                return Ok(());
            }
            SessionEvent::Failed { reason } => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                warn!("Transfer failed: {}", reason);
                println!("Transfer failed, waiting for a new request");
            }
            SessionEvent::Sent { .. } | SessionEvent::PeerClosed { .. } => {}
        }
    }

    Err("Client stopped before a file arrived".into())
}
