//! TCP gossip transport
//!
//! Newline-delimited JSON `SignedMessage`s. Outbound connections are kept per
//! peer and re-dialled once when a write fails.

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{GossipError, GossipTransport, SignedMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_LINE_BYTES: usize = 64 * 1024;

struct Peer {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

pub struct TcpGossip {
    peers: Vec<Arc<Peer>>,
}

impl TcpGossip {
    /// Bind the listener and start accepting peers; returns the transport and inbound stream
    pub async fn bind(
        listen_addr: &str,
        peers: &[String],
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, mpsc::Receiver<SignedMessage>), GossipError> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(addr = %listener.local_addr()?, peers = peers.len(), "🛰️ Gossip listening");

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        tokio::spawn(accept_loop(listener, inbound_tx, shutdown));

        let peers = peers
            .iter()
            .map(|addr| {
                Arc::new(Peer {
                    addr: addr.clone(),
                    stream: Mutex::new(None),
                })
            })
            .collect();
        Ok((Self { peers }, inbound_rx))
    }

    async fn send_to(peer: &Peer, line: &[u8]) -> Result<(), GossipError> {
        let mut guard = peer.stream.lock().await;
        for _ in 0..2 {
            if guard.is_none() {
                let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer.addr))
                    .await
                    .map_err(|_| {
                        std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
                    })??;
                stream.set_nodelay(true)?;
                *guard = Some(stream);
            }
            if let Some(stream) = guard.as_mut() {
                match stream.write_all(line).await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!(peer = %peer.addr, error = %e, "Gossip write failed, re-dialling");
                        *guard = None;
                    }
                }
            }
        }
        Err(GossipError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("could not deliver to {}", peer.addr),
        )))
    }
}

#[async_trait]
impl GossipTransport for TcpGossip {
    async fn broadcast(&self, message: &SignedMessage) -> Result<usize, GossipError> {
        if self.peers.is_empty() {
            return Ok(0);
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let line = Arc::new(line);
        let sends = self.peers.iter().map(|peer| {
            let peer = Arc::clone(peer);
            let line = Arc::clone(&line);
            async move {
                let result = Self::send_to(&peer, &line).await;
                if let Err(e) = &result {
                    warn!(peer = %peer.addr, error = %e, "Gossip send failed");
                }
                result.is_ok()
            }
        });
        let delivered = futures_util::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();

        if delivered == 0 {
            return Err(GossipError::NoPeerReachable);
        }
        Ok(delivered)
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<SignedMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Gossip peer connected");
                    tokio::spawn(read_peer(stream, inbound.clone(), shutdown.clone()));
                }
                Err(e) => {
                    // Back off with jitter so a burst of accept errors does not spin
                    let jitter = rand::thread_rng().gen_range(50..250);
                    warn!(error = %e, "Gossip accept failed");
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn read_peer(
    stream: TcpStream,
    inbound: mpsc::Sender<SignedMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream.peer_addr().ok();
    let mut lines = BufReader::new(stream).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => break,
        };
        match line {
            Ok(Some(line)) => {
                if line.len() > MAX_LINE_BYTES {
                    warn!(?peer, len = line.len(), "Oversized gossip line dropped");
                    continue;
                }
                match serde_json::from_str::<SignedMessage>(&line) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(?peer, error = %e, "Malformed gossip line"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(?peer, error = %e, "Gossip read failed");
                break;
            }
        }
    }
}
