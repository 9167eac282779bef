//! Gossip adapter between the [`Hashgraph`] and a [`Transport`].
//!
//! Inbound path:
//! 1) decode the envelope (undecodable input is dropped and logged, never returned to the sender),
//! 2) admit the block,
//! 3) on `Pending`, ask the sender for the missing ancestors and keep asking the topic's audience
//!    on a timer until the retry budget runs out or the pending block expires,
//! 4) on `Committed`, forward any previously pending blocks that were just released.
//!
//! Outbound path: blocks created through the adapter are committed locally first, then sent to
//! their recipients. Sends are fire-and-forget here; delivery guarantees belong to the transport.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::select;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::block::{short, Block, BlockEventAcl, BlockHash, EventType, PeerId};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::hashgraph::{Hashgraph, Outgoing};
use crate::protocol::ProtocolMessage;
use crate::store::Admission;
use crate::transport::{Inbound, Transport};

/// Outstanding request for a missing ancestor.
#[derive(Debug, Clone)]
struct BackfillRequest {
    topic: BlockHash,
    /// Peer that sent us the block missing this ancestor.
    origin: PeerId,
    attempts: u32,
    next_attempt: Instant,
}

/// Network-facing side of one peer's hashgraph. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncAdapter {
    hashgraph: Hashgraph,
    transport: Arc<dyn Transport>,
    config: SyncConfig,
    backfill: Arc<Mutex<HashMap<BlockHash, BackfillRequest>>>,
}

impl SyncAdapter {
    pub fn new(hashgraph: Hashgraph, transport: Arc<dyn Transport>, config: SyncConfig) -> Self {
        Self {
            hashgraph,
            transport,
            config,
            backfill: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn hashgraph(&self) -> &Hashgraph {
        &self.hashgraph
    }

    pub async fn create_graph(&self, acl: BlockEventAcl) -> Result<Block> {
        let out = self.hashgraph.create_graph(acl).await?;
        Ok(self.disseminate(out).await)
    }

    pub async fn append(&self, topic: &str, data: impl Into<String>) -> Result<Block> {
        let out = self.hashgraph.append(topic, data).await?;
        Ok(self.disseminate(out).await)
    }

    pub async fn append_typed(&self, topic: &str, kind: EventType, data: impl Into<String>) -> Result<Block> {
        let out = self.hashgraph.append_typed(topic, kind, data).await?;
        Ok(self.disseminate(out).await)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<Block> {
        let out = self.hashgraph.subscribe(topic).await?;
        Ok(self.disseminate(out).await)
    }

    pub async fn get(&self, hash: &str) -> Result<Block> {
        self.hashgraph.get(hash).await
    }

    pub fn handle_block<F>(&self, handler: F)
    where
        F: Fn(&Block) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hashgraph.handle_block(handler);
    }

    /// Asks `peer` for specific blocks, e.g. the root of a topic we were told about out of band.
    pub async fn fetch(&self, peer: &str, hashes: Vec<BlockHash>) {
        self.send(ProtocolMessage::Request(hashes), vec![peer.to_string()])
            .await;
    }

    /// Number of missing ancestors we are currently trying to backfill.
    pub async fn backfill_len(&self) -> usize {
        self.backfill.lock().await.len()
    }

    /// Processes one inbound envelope. Never fails: bad input is logged and dropped.
    pub async fn handle_inbound(&self, inbound: Inbound) {
        let Inbound { sender, envelope } = inbound;
        let message = match ProtocolMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(err) => {
                warn!(%sender, message_type = %envelope.message_type, error = %err, "Dropping undecodable message");
                return;
            }
        };

        match message {
            ProtocolMessage::Event(block) => {
                let hash = block.hash.clone();
                if let Err(err) = self.receive_block(&sender, block).await {
                    warn!(%sender, block = short(&hash), error = %err, "Dropping invalid block");
                }
            }
            ProtocolMessage::Request(hashes) => self.serve_request(&sender, hashes).await,
        }
    }

    /// Admits a block received from `sender` and drives backfill or forwarding.
    pub async fn receive_block(&self, sender: &str, block: Block) -> Result<Admission> {
        let topic = block.topic_id().to_string();
        let (admission, report) = self.hashgraph.admit_reported(block).await?;

        match &admission {
            Admission::AlreadyExists => {
                trace!(%sender, "Ignoring known block");
            }
            Admission::Committed(blocks) => {
                {
                    let mut backfill = self.backfill.lock().await;
                    for block in blocks {
                        backfill.remove(&block.hash);
                    }
                }
                if !report.is_clean() {
                    debug!(failures = report.failures.len(), "Some block handlers failed");
                }
                // Blocks released from pending were never forwarded by us.
                for released in blocks.iter().skip(1) {
                    self.forward(released).await;
                }
            }
            Admission::Pending(missing) => {
                self.request_missing(sender, &topic, missing, Instant::now())
                    .await;
            }
        }

        Ok(admission)
    }

    /// Expires stale pending blocks and retries backfill that is due.
    pub async fn tick(&self, now: Instant) {
        for dropped in self.hashgraph.expire_pending(now).await {
            warn!(block = dropped.short_hash(), "Dropped pending block, ancestors never arrived");
        }

        let missing = self.hashgraph.missing_ancestors().await;
        let due: Vec<(BlockHash, BackfillRequest)> = {
            let mut backfill = self.backfill.lock().await;
            backfill.retain(|hash, _| missing.contains(hash));
            backfill
                .iter_mut()
                .filter(|(_, req)| req.attempts < self.config.backfill_retries && req.next_attempt <= now)
                .map(|(hash, req)| {
                    req.attempts += 1;
                    req.next_attempt = now + self.config.backfill_interval;
                    (hash.clone(), req.clone())
                })
                .collect()
        };

        let mut per_peer: BTreeMap<PeerId, Vec<BlockHash>> = BTreeMap::new();
        for (hash, req) in due {
            let mut targets = self
                .hashgraph
                .find_subscribers(&req.topic)
                .await
                .unwrap_or_default();
            targets.insert(req.origin.clone());
            targets.remove(self.hashgraph.peer_id());
            debug!(block = short(&hash), attempt = req.attempts, targets = targets.len(), "Retrying backfill");
            for target in targets {
                per_peer.entry(target).or_default().push(hash.clone());
            }
        }

        for (peer, mut hashes) in per_peer {
            hashes.sort();
            self.send(ProtocolMessage::Request(hashes), vec![peer]).await;
        }
    }

    /// Runs the inbound loop until the inbox closes.
    pub async fn run(self, mut inbox: UnboundedReceiver<Inbound>) {
        info!(peer = self.hashgraph.peer_id(), "Sync loop starting");
        let mut sweep = interval(self.config.sweep_interval);
        loop {
            select! {
                maybe_inbound = inbox.recv() => {
                    match maybe_inbound {
                        Some(inbound) => self.handle_inbound(inbound).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
        info!(peer = self.hashgraph.peer_id(), "Sync loop stopped");
    }

    async fn request_missing(&self, sender: &str, topic: &str, missing: &BTreeSet<BlockHash>, now: Instant) {
        let mut fresh = Vec::new();
        {
            let mut backfill = self.backfill.lock().await;
            for hash in missing {
                if backfill.contains_key(hash) {
                    continue;
                }
                backfill.insert(
                    hash.clone(),
                    BackfillRequest {
                        topic: topic.to_string(),
                        origin: sender.to_string(),
                        attempts: 1,
                        next_attempt: now + self.config.backfill_interval,
                    },
                );
                fresh.push(hash.clone());
            }
        }

        if fresh.is_empty() {
            return;
        }
        debug!(%sender, missing = fresh.len(), "Requesting missing ancestors");
        self.send(ProtocolMessage::Request(fresh), vec![sender.to_string()])
            .await;
    }

    /// Answers a block request with every requested block the sender may see.
    async fn serve_request(&self, sender: &str, mut hashes: Vec<BlockHash>) {
        if hashes.len() > self.config.max_request_hashes {
            debug!(
                %sender,
                requested = hashes.len(),
                limit = self.config.max_request_hashes,
                "Truncating oversized block request"
            );
            hashes.truncate(self.config.max_request_hashes);
        }
        for hash in hashes {
            let block = match self.hashgraph.get(&hash).await {
                Ok(block) => block,
                Err(_) => {
                    trace!(%sender, block = short(&hash), "Requested block unknown here");
                    continue;
                }
            };
            if !self.may_read(sender, &block).await {
                debug!(%sender, block = block.short_hash(), "Refusing block outside requester's access");
                continue;
            }
            self.send(ProtocolMessage::Event(block), vec![sender.to_string()])
                .await;
        }
    }

    /// Open topics (empty ACL) are readable by anyone; otherwise the requester must be in the
    /// block's audience.
    async fn may_read(&self, peer: &str, block: &Block) -> bool {
        match self.hashgraph.get(block.topic_id()).await {
            Ok(root) if root.event.acl.is_empty() => true,
            Ok(_) => self
                .hashgraph
                .recipients(block)
                .await
                .map(|recipients| recipients.contains(peer))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disseminate(&self, out: Outgoing) -> Block {
        let Outgoing { block, recipients, .. } = out;
        self.send(ProtocolMessage::Event(block.clone()), recipients.into_iter().collect())
            .await;
        block
    }

    /// Sends a remotely authored block on to its audience, skipping its author.
    async fn forward(&self, block: &Block) {
        match self.hashgraph.recipients(block).await {
            Ok(mut recipients) => {
                recipients.remove(&block.event.author);
                self.send(ProtocolMessage::Event(block.clone()), recipients.into_iter().collect())
                    .await;
            }
            Err(err) => warn!(block = block.short_hash(), error = %err, "Cannot resolve recipients"),
        }
    }

    async fn send(&self, message: ProtocolMessage, recipients: Vec<PeerId>) {
        if recipients.is_empty() {
            return;
        }
        let envelope = match message.to_envelope() {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "Failed to encode outbound message");
                return;
            }
        };
        if let Err(err) = self.transport.send(envelope, &recipients).await {
            warn!(recipients = recipients.len(), error = %err, "Send failed");
        }
    }
}
