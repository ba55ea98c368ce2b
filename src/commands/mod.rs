//! # Commands Module
//!
//! Command handlers behind the `peerdrop` binary:
//!
//! ## `serve`
//! Runs the rendezvous server:
//! - Assigns every websocket a peer id
//! - Broadcasts the peer list on every join and leave
//! - Relays signaling envelopes to all other peers
//!
//! ## `send`
//! Sends one file to another peer:
//! - Optionally encrypts it with a shared key first
//! - Picks the recipient from the peer list
//! - Runs the request/offer/answer handshake and streams chunks
//!
//! ## `receive`
//! Waits for a transfer request:
//! - Accepts it (after asking, unless `--yes`)
//! - Reassembles the chunks and optionally decrypts them
//! - Writes `received_<name>`
//!
//! ## `crypt`
//! Standalone `encrypt`, `decrypt` and `keygen` tools for the file cipher.

use std::io::{self, Write};

use arboard::Clipboard;
use indicatif::{ProgressBar, ProgressStyle};

pub mod crypt;
pub mod receive;
pub mod send;
pub mod serve;

/// Copy text to the clipboard. Headless systems have none, which is fine.
pub(crate) fn copy_to_clipboard(text: &str) -> bool {
    match Clipboard::new() {
        Ok(mut clipboard) => clipboard.set_text(text.to_string()).is_ok(),
        Err(_) => false,
    }
}

pub(crate) fn byte_progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")
    {
        bar.set_style(style);
    }
    bar
}

/// Ask a yes/no question on stdin without blocking the runtime.
pub(crate) async fn confirm(question: String) -> io::Result<bool> {
    tokio::task::spawn_blocking(move || {
        print!("{} [y/N] ", question);
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    })
    .await
    .map_err(io::Error::other)?
}
