use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use peerdrop::commands::{crypt, receive, send, serve};
use peerdrop::utils::ClientConfig;
use peerdrop::{DEFAULT_PORT, DEFAULT_SIGNALING_URL, DEFAULT_STUN_SERVER};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Peer-to-peer file transfer with a rendezvous server", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where to find the rendezvous server and how to reach peers.
#[derive(Args)]
struct ConnectArgs {
    /// Rendezvous server websocket URL
    #[arg(long, default_value = DEFAULT_SIGNALING_URL)]
    url: String,

    /// STUN/TURN server URL (repeatable)
    #[arg(long = "stun", default_value = DEFAULT_STUN_SERVER)]
    stun: Vec<String>,
}

impl ConnectArgs {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            signaling_url: self.url,
            ice_servers: self.stun,
            ..ClientConfig::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous server
    Serve {
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Send a file to another peer
    Send {
        /// Path to the file to send
        file_path: String,

        /// Peer id of the recipient (default: first peer online)
        #[arg(long)]
        to: Option<String>,

        /// Encrypt with this base64 key before sending
        #[arg(long)]
        key: Option<String>,

        /// Encrypt with a freshly generated key before sending
        #[arg(long)]
        encrypt: bool,

        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Wait for a file from another peer
    Receive {
        /// Decrypt the received file with this base64 key
        #[arg(long)]
        key: Option<String>,

        /// Accept the first request without asking
        #[arg(short, long)]
        yes: bool,

        /// Directory to write the received file to
        #[arg(short, long, default_value = ".")]
        out: PathBuf,

        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Encrypt a file with the file cipher
    Encrypt {
        file_path: String,

        /// Base64 key (a new one is generated if omitted)
        #[arg(long)]
        key: Option<String>,
    },
    /// Decrypt a file produced by `encrypt`
    Decrypt {
        file_path: String,

        #[arg(long)]
        key: String,
    },
    /// Generate a new file key
    Keygen,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve { port } => {
            serve::run(port).await?;
        }
        Commands::Send { file_path, to, key, encrypt, connect } => {
            let options = send::SendOptions { to, key, encrypt };
            send::run(&file_path, options, connect.into_config()).await?;
        }
        Commands::Receive { key, yes, out, connect } => {
            let config = ClientConfig {
                output_dir: out,
                auto_accept: yes,
                ..connect.into_config()
            };
            receive::run(key, config).await?;
        }
        Commands::Encrypt { file_path, key } => {
            crypt::encrypt(&file_path, key).await?;
        }
        Commands::Decrypt { file_path, key } => {
            crypt::decrypt(&file_path, &key).await?;
        }
        Commands::Keygen => {
            crypt::keygen();
        }
    }

    Ok(())
}
