//! In-process gossip hub for simulations and tests

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use super::{GossipError, GossipTransport, SignedMessage};

/// Shared bus; every joined node sees every broadcast (including its own)
#[derive(Debug, Clone)]
pub struct LocalGossipHub {
    tx: broadcast::Sender<SignedMessage>,
}

impl LocalGossipHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Attach a node: returns its outbound transport and inbound stream
    pub fn join(&self) -> (LocalGossip, mpsc::Receiver<SignedMessage>) {
        let mut rx = self.tx.subscribe();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Local gossip receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        (
            LocalGossip {
                tx: self.tx.clone(),
            },
            inbound_rx,
        )
    }
}

/// Outbound handle onto a `LocalGossipHub`
#[derive(Debug, Clone)]
pub struct LocalGossip {
    tx: broadcast::Sender<SignedMessage>,
}

#[async_trait]
impl GossipTransport for LocalGossip {
    async fn broadcast(&self, message: &SignedMessage) -> Result<usize, GossipError> {
        self.tx
            .send(message.clone())
            .map_err(|_| GossipError::Closed)
    }
}
