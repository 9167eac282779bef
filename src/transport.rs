//! Transport boundary.
//!
//! The hashgraph core only needs two things from the peer-messaging substrate: a way to send an
//! [`Envelope`] to a set of peers, and a stream of [`Inbound`] envelopes tagged with their sender.
//! Inbound delivery is a tokio channel so transports and the sync loop never call into each other.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::block::PeerId;
use crate::error::{HashgraphError, Result};
use crate::protocol::Envelope;

/// An envelope received from a peer.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub sender: PeerId,
    pub envelope: Envelope,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `envelope` to every peer in `recipients`.
    ///
    /// Delivery is best effort; an error reports the recipients that could not be reached after
    /// every recipient was attempted.
    async fn send(&self, envelope: Envelope, recipients: &[PeerId]) -> Result<()>;
}

/// In-process message router connecting any number of local peers.
///
/// Useful for tests and single-process simulations: each registered peer gets a receiver, and
/// [`MemoryTransport`]s deliver straight into the recipients' channels.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerId, UnboundedSender<Inbound>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `peer` and returns its inbox together with a transport sending as `peer`.
    pub fn register(
        self: &Arc<Self>,
        peer: impl Into<PeerId>,
    ) -> (MemoryTransport, UnboundedReceiver<Inbound>) {
        let peer = peer.into();
        let (tx, rx) = unbounded_channel();
        self.nodes.insert(peer.clone(), tx);
        (
            MemoryTransport {
                local: peer,
                network: Arc::clone(self),
            },
            rx,
        )
    }

    /// Disconnects `peer`; later sends to it fail.
    pub fn unregister(&self, peer: &str) {
        self.nodes.remove(peer);
    }

    fn route(&self, sender: &str, recipient: &str, envelope: Envelope) -> std::result::Result<(), String> {
        let tx = self
            .nodes
            .get(recipient)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| format!("unknown peer {recipient}"))?;
        tx.send(Inbound {
            sender: sender.to_string(),
            envelope,
        })
        .map_err(|_| format!("peer {recipient} is gone"))
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    local: PeerId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Envelope, recipients: &[PeerId]) -> Result<()> {
        let failures: Vec<String> = recipients
            .iter()
            .filter_map(|recipient| {
                self.network
                    .route(&self.local, recipient, envelope.clone())
                    .err()
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HashgraphError::Transport(failures.join("; ")))
        }
    }
}
