use std::error::Error;
use std::path::Path;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use crate::bytes::read_file;
use crate::client::{self, Command};
use crate::commands::{byte_progress_bar, copy_to_clipboard};
use crate::cryptography::{decode_key, encode_key, encrypt_file, generate_key};
use crate::session::{OutgoingFile, SessionEvent};
use crate::signaling::PeerId;
use crate::transport::Role;
use crate::utils::ClientConfig;
use crate::SEND_LINGER;

pub struct SendOptions {
    pub to: Option<PeerId>,
    pub key: Option<String>,
    pub encrypt: bool,
}

/// Send one file to a peer:
///     - Read the file, and encrypt it if a key was given or `--encrypt` is set
///     - Register with the rendezvous server and wait for a recipient to show up
///     - Request the transfer, negotiate the channel and stream the chunks
///     - Exit once the recipient hangs up after the completion marker
pub async fn run(file_path: &str, options: SendOptions, config: ClientConfig) -> Result<(), Box<dyn Error>> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(format!("Not a file: {}", file_path).into());
    }

    let (metadata, mut data) = read_file(path).await?;
    debug!("Loaded {} ({} bytes)", metadata.name, metadata.size);

    let key = match (&options.key, options.encrypt) {
        (Some(text), _) => Some(decode_key(text)?),
        (None, true) => {
            let key = generate_key();
            let text = encode_key(&key);
            let copied = if copy_to_clipboard(&text) { " (copied to clipboard)" } else { "" };
            println!("Encryption key{}: \x1b[4m\x1b[1m{}\x1b[0m", copied, text);
            Some(key)
        }
        (None, false) => None,
    };
    if let Some(key) = key {
        data = encrypt_file(&key, &data);
        info!("Encrypted {} into {} bytes", metadata.name, data.len());
    }
    let mut file = Some(OutgoingFile::new(metadata.name, data));

    let mut handle = client::spawn(config);
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Registered { peer_id } => println!("Connected as {}", peer_id),
            SessionEvent::Peers { peers } => {
                debug!("Peers: {:?}", peers);
                let Some(target) = pick_recipient(&peers, options.to.as_ref()) else {
                    if file.is_some() {
                        println!("Waiting for a recipient...");
                    }
                    continue;
                };
                if let Some(file) = file.take() {
                    println!("Requesting transfer to {}", target);
                    handle.commands.send(Command::Send { target, file })?;
                }
            }
            SessionEvent::ChannelOpen { remote } => info!("Connected to {}", remote),
            SessionEvent::Started { metadata, .. } => {
                bar = Some(byte_progress_bar(metadata.map(|m| m.size).unwrap_or_default()));
            }
            SessionEvent::Progress { role: Role::Offerer, bytes, .. } => {
                if let Some(bar) = &bar {
                    bar.set_position(bytes);
                }
            }
            SessionEvent::Sent { metadata } => {
                if let Some(bar) = bar.take() {
                    bar.finish_with_message("Transfer complete!");
                }
                println!("Sent {} ({} bytes)", metadata.name, metadata.size);
                wait_for_hang_up(&mut handle.events).await;
                let _ = handle.commands.send(Command::Shutdown);
                return Ok(());
            }
            SessionEvent::Failed { reason } => {
                if let Some(bar) = bar.take() {
                    bar.abandon();
                }
                let _ = handle.commands.send(Command::Shutdown);
                return Err(format!("Transfer failed: {}", reason).into());
            }
            SessionEvent::IncomingRequest { from } => {
                warn!("Ignoring transfer request from {} while sending", from);
                let _ = handle.commands.send(Command::Decline);
            }
            SessionEvent::PeerClosed { remote } => debug!("{} closed an old channel", remote),
            SessionEvent::Progress { .. } | SessionEvent::Received { .. } => {}
        }
    }

    Err("Client stopped before the transfer finished".into())
}

/// The channel stays open until the recipient has read everything and closes
/// its end, or until `SEND_LINGER` runs out.
async fn wait_for_hang_up(events: &mut UnboundedReceiver<SessionEvent>) {
    let hang_up = async {
        while let Some(event) = events.recv().await {
            if let SessionEvent::PeerClosed { remote } = event {
                debug!("{} closed the channel", remote);
                return;
            }
        }
    };
    if timeout(SEND_LINGER, hang_up).await.is_err() {
        warn!("Recipient did not close the channel within {:?}", SEND_LINGER);
    }
}

/// The requested peer if it is online, otherwise the first peer when none was requested.
fn pick_recipient(peers: &[PeerId], wanted: Option<&PeerId>) -> Option<PeerId> {
    match wanted {
        Some(wanted) => peers.iter().find(|p| *p == wanted).cloned(),
        None => peers.first().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_hang_up_returns_on_close() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tx.send(SessionEvent::Peers { peers: vec![] }).unwrap();
        tx.send(SessionEvent::PeerClosed { remote: "peer-2".into() }).unwrap();

        let start = tokio::time::Instant::now();
        wait_for_hang_up(&mut rx).await;
        assert!(start.elapsed() < SEND_LINGER);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_hang_up_gives_up() {
        let (_tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SessionEvent>();
        let start = tokio::time::Instant::now();
        wait_for_hang_up(&mut rx).await;
        assert!(start.elapsed() >= SEND_LINGER);
    }

    #[test]
    fn test_pick_recipient() {
        let peers = vec!["peer-2".to_string(), "peer-3".to_string()];
        assert_eq!(pick_recipient(&peers, None), Some("peer-2".to_string()));
        assert_eq!(pick_recipient(&peers, Some(&"peer-3".to_string())), Some("peer-3".to_string()));
        assert_eq!(pick_recipient(&peers, Some(&"peer-9".to_string())), None);
        assert_eq!(pick_recipient(&[], None), None);
    }
}
