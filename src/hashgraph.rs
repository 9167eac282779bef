//! Topic lifecycle on top of the block store.
//!
//! The [`Hashgraph`] builds blocks on behalf of the local peer, commits them, works out who must
//! receive them and notifies local observers of every newly committed block. It never talks to the
//! network itself; see [`crate::sync::SyncAdapter`].

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};
use std::time::Instant;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::block::{Block, BlockEventAcl, BlockHash, EventType, PeerId};
use crate::config::SyncConfig;
use crate::error::{HashgraphError, Result};
use crate::store::{Admission, BlockStore};

/// Observer invoked once per newly committed block.
pub type BlockHandler = Arc<dyn Fn(&Block) -> anyhow::Result<()> + Send + Sync>;

/// A freshly committed local block, the peers it must be sent to and how local handlers fared.
#[derive(Debug)]
pub struct Outgoing {
    pub block: Block,
    pub recipients: BTreeSet<PeerId>,
    pub report: NotifyReport,
}

#[derive(Debug)]
pub struct HandlerFailure {
    pub block: BlockHash,
    /// Registration order of the failing handler.
    pub handler: usize,
    pub error: anyhow::Error,
}

/// Result of running the registered handlers over a batch of committed blocks.
#[derive(Debug, Default)]
pub struct NotifyReport {
    pub delivered: usize,
    pub failures: Vec<HandlerFailure>,
}

impl NotifyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Coordinator for the topics of one local peer. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Hashgraph {
    peer: PeerId,
    store: Arc<RwLock<BlockStore>>,
    /// Serializes admissions so handlers observe blocks in commit order.
    commit_lock: Arc<Mutex<()>>,
    handlers: Arc<StdRwLock<Vec<BlockHandler>>>,
}

impl Hashgraph {
    pub fn new(peer: impl Into<PeerId>, config: &SyncConfig) -> Self {
        Self {
            peer: peer.into(),
            store: Arc::new(RwLock::new(BlockStore::with_config(config))),
            commit_lock: Arc::new(Mutex::new(())),
            handlers: Arc::new(StdRwLock::new(Vec::new())),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer
    }

    /// Starts a new topic owned by the local peer.
    pub async fn create_graph(&self, acl: BlockEventAcl) -> Result<Outgoing> {
        let block = Block::create(self.peer.clone(), acl);
        self.commit_local(|_| Ok(block)).await
    }

    /// Appends `data` to `topic` as a `graph.append` block.
    pub async fn append(&self, topic: &str, data: impl Into<String>) -> Result<Outgoing> {
        self.append_typed(topic, EventType::Append, data).await
    }

    /// Appends a block with a caller-chosen event type.
    pub async fn append_typed(
        &self,
        topic: &str,
        kind: EventType,
        data: impl Into<String>,
    ) -> Result<Outgoing> {
        if kind == EventType::Create {
            return Err(HashgraphError::MalformedBlock(
                "graph.create blocks are built by create_graph".into(),
            ));
        }
        let data = data.into();
        let author = self.peer.clone();
        let topic = topic.to_string();
        self.commit_local(move |store| {
            let parents = store.find_tip(&topic)?;
            Ok(Block::child(author, topic, parents.into_iter().collect(), kind, data))
        })
        .await
    }

    /// Subscribes the local peer to `topic`.
    ///
    /// The subscribe block goes to the topic's existing audience so they start sending to us.
    pub async fn subscribe(&self, topic: &str) -> Result<Outgoing> {
        self.append_typed(topic, EventType::Subscribe, String::new()).await
    }

    /// Registers an observer for newly committed blocks.
    pub fn handle_block<F>(&self, handler: F)
    where
        F: Fn(&Block) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Admits a block received from elsewhere and notifies handlers of whatever got committed.
    pub async fn admit(&self, block: Block) -> Result<Admission> {
        self.admit_reported(block).await.map(|(admission, _)| admission)
    }

    /// [`Hashgraph::admit`], also returning how the handlers fared.
    pub async fn admit_reported(&self, block: Block) -> Result<(Admission, NotifyReport)> {
        let _commit = self.commit_lock.lock().await;
        let admission = self.store.write().await.add(block)?;
        let report = self.notify(admission.committed());
        Ok((admission, report))
    }

    pub async fn get(&self, hash: &str) -> Result<Block> {
        self.store.read().await.get(hash).cloned()
    }

    pub async fn contains(&self, hash: &str) -> bool {
        self.store.read().await.contains(hash)
    }

    pub async fn find_tip(&self, topic: &str) -> Result<Vec<BlockHash>> {
        self.store.read().await.find_tip(topic)
    }

    pub async fn find_subscribers(&self, topic: &str) -> Result<BTreeSet<PeerId>> {
        self.store.read().await.find_subscribers(topic)
    }

    /// Peers that must receive `block`: the topic's subscribers, its ACL and its creator,
    /// without the local peer.
    pub async fn recipients(&self, block: &Block) -> Result<BTreeSet<PeerId>> {
        let store = self.store.read().await;
        Self::recipients_in(&store, &self.peer, block)
    }

    pub async fn missing_ancestors(&self) -> BTreeSet<BlockHash> {
        self.store.read().await.missing_ancestors()
    }

    pub async fn pending_topic(&self, hash: &str) -> Option<BlockHash> {
        self.store.read().await.pending_topic(hash)
    }

    pub async fn expire_pending(&self, now: Instant) -> Vec<Block> {
        let _commit = self.commit_lock.lock().await;
        self.store.write().await.expire_pending(now)
    }

    /// Committed and pending block counts.
    pub async fn stats(&self) -> (usize, usize) {
        let store = self.store.read().await;
        (store.len(), store.pending_len())
    }

    /// Runs every handler over `blocks`, in order. A failing handler never stops the others.
    pub fn notify(&self, blocks: &[Block]) -> NotifyReport {
        let handlers: Vec<BlockHandler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = NotifyReport::default();
        for block in blocks {
            for (idx, handler) in handlers.iter().enumerate() {
                match handler(block) {
                    Ok(()) => report.delivered += 1,
                    Err(error) => {
                        warn!(block = block.short_hash(), handler = idx, error = %error, "Block handler failed");
                        report.failures.push(HandlerFailure {
                            block: block.hash.clone(),
                            handler: idx,
                            error,
                        });
                    }
                }
            }
        }
        report
    }

    /// Builds a block against the locked store, commits it and resolves its recipients.
    async fn commit_local<F>(&self, build: F) -> Result<Outgoing>
    where
        F: FnOnce(&BlockStore) -> Result<Block>,
    {
        let _commit = self.commit_lock.lock().await;
        let (block, recipients) = {
            let mut store = self.store.write().await;
            let block = build(&*store)?;
            let admission = store.add(block.clone())?;
            debug!(
                block = block.short_hash(),
                kind = %block.event.kind,
                committed = admission.is_committed(),
                "Committed local block"
            );
            let recipients = Self::recipients_in(&store, &self.peer, &block)?;
            (block, recipients)
        };
        let report = self.notify(std::slice::from_ref(&block));
        Ok(Outgoing {
            block,
            recipients,
            report,
        })
    }

    fn recipients_in(store: &BlockStore, local: &str, block: &Block) -> Result<BTreeSet<PeerId>> {
        let topic = block.topic_id();
        let mut recipients = store.find_subscribers(topic)?;
        recipients.insert(store.root_of(topic)?.event.author.clone());
        recipients.remove(local);
        Ok(recipients)
    }
}
