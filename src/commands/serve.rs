use std::error::Error;

use log::{debug, info};

use crate::rendezvous::RendezvousServer;

/// Run the rendezvous server on `0.0.0.0:<port>` until the listener fails.
///
/// The server never sees file data. It hands out peer ids, keeps the peer
/// list current and passes negotiation envelopes between peers.
pub async fn run(port: u16) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("0.0.0.0:{}", port);
    debug!("Attempting to bind to {}", bind_addr);

    let server = RendezvousServer::bind(&bind_addr).await?;
    println!("Server listening on {}", server.local_addr()?);
    info!("Rendezvous server started on {}", bind_addr);

    server.run().await?;
    Ok(())
}
