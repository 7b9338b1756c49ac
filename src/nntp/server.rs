//! The inbound NNTP acceptor.
//!
//! Binds the configured address, gates every accepted socket through the
//! peer ACL, and runs one [`Session`] task per connection. With no peers
//! configured the server is an open reader; once peers exist, unmatched
//! addresses are turned away before the greeting.

use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use super::session::{ServerCtx, Session};

pub struct NntpServer {
    ctx: Arc<ServerCtx>,
}

impl NntpServer {
    pub fn new(ctx: Arc<ServerCtx>) -> Self {
        Self { ctx }
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        let addr = format!("{}:{}", self.ctx.server.host, self.ctx.server.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "NNTP server listening");
        Ok(listener)
    }

    /// Accept connections until `shutdown` closes.
    pub async fn run(&self, listener: TcpListener, shutdown: async_channel::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, remote.ip(), ctx).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Acceptor shutting down");
                    return;
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, remote: std::net::IpAddr, ctx: Arc<ServerCtx>) {
    let _ = stream.set_nodelay(true);

    // ACL: with peers configured, the remote must match one; an empty peer
    // table leaves the server open for readers.
    let peer = if ctx.peers.peers().is_empty() {
        None
    } else {
        match ctx.peers.check_connection_acl(remote).await {
            Some(peer) => Some(peer),
            None => {
                let _ = stream
                    .write_all(b"502 connection not permitted\r\n")
                    .await;
                let _ = stream.shutdown().await;
                return;
            }
        }
    };

    let peer_name: &str = peer.as_ref().map(|p| p.name.as_str()).unwrap_or("-");
    tracing::info!(
        %remote,
        peer = peer_name,
        "Session started"
    );
    Session::new(stream, ctx, peer).run().await;
    tracing::debug!(%remote, "Session ended");
}
