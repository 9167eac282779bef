//! Committed block DAG.
//!
//! Every topic is a directed acyclic graph hanging off one `graph.create` block. Blocks reference
//! their causal predecessors (parents); the store only ever grows:
//! - Blocks are content-addressed, so re-admitting a known hash is a no-op.
//! - A block is committed only once every parent is committed. Blocks that arrive early are held
//!   in the [`PendingIndex`] and committed automatically when their ancestors show up.
//! - Concurrent appends are not ordered; they become explicit forks. The tip set of a topic is its
//!   concurrent frontier, and the next local append lists all tips as parents, joining them.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Instant;

use dashmap::DashMap;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;
use tracing::{debug, warn};

use crate::block::{short, Block, BlockHash, EventType, PeerId};
use crate::config::SyncConfig;
use crate::error::{HashgraphError, Result};
use crate::pending::PendingIndex;

/// Outcome of [`BlockStore::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The block was committed. The first entry is the admitted block, followed by every pending
    /// block it released, in commit order.
    Committed(Vec<Block>),
    /// The hash is already committed; nothing changed.
    AlreadyExists,
    /// The block is held until the listed ancestors are committed.
    Pending(BTreeSet<BlockHash>),
}

impl Admission {
    pub fn is_committed(&self) -> bool {
        matches!(self, Admission::Committed(_))
    }

    /// Blocks newly committed by this admission.
    pub fn committed(&self) -> &[Block] {
        match self {
            Admission::Committed(blocks) => blocks,
            _ => &[],
        }
    }
}

/// Append-only store of every topic this peer has seen.
pub struct BlockStore {
    /// Nodes are committed blocks, edges point from child to parent.
    graph: StableDiGraph<Block, ()>,
    /// Content hash to node, for dedup and parent resolution.
    index_map: DashMap<BlockHash, NodeIndex>,
    /// Concurrent frontier per topic id.
    tips: HashMap<BlockHash, BTreeSet<BlockHash>>,
    pending: PendingIndex,
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore {
    pub fn new() -> Self {
        Self::with_config(&SyncConfig::default())
    }

    pub fn with_config(config: &SyncConfig) -> Self {
        Self {
            graph: StableDiGraph::new(),
            index_map: DashMap::new(),
            tips: HashMap::new(),
            pending: PendingIndex::new(config.pending_ttl, config.max_pending),
        }
    }

    /// Number of committed blocks.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.index_map.contains_key(hash)
    }

    pub fn is_pending(&self, hash: &str) -> bool {
        self.pending.contains(hash)
    }

    pub fn get(&self, hash: &str) -> Result<&Block> {
        let idx = self.node(hash).ok_or_else(|| HashgraphError::NotFound(hash.to_string()))?;
        self.graph
            .node_weight(idx)
            .ok_or_else(|| HashgraphError::NotFound(hash.to_string()))
    }

    /// The `graph.create` block of `topic`.
    pub fn root_of(&self, topic: &str) -> Result<&Block> {
        match self.get(topic) {
            Ok(block) if block.is_create() => Ok(block),
            _ => Err(HashgraphError::UnknownTopic(topic.to_string())),
        }
    }

    /// Hashes some pending block is still waiting on.
    pub fn missing_ancestors(&self) -> BTreeSet<BlockHash> {
        self.pending.missing()
    }

    /// Topic of a pending block, if one with this hash is held.
    pub fn pending_topic(&self, hash: &str) -> Option<BlockHash> {
        self.pending
            .get(hash)
            .map(|entry| entry.block.topic_id().to_string())
    }

    /// Admits a block.
    ///
    /// Fails with `IntegrityError` when the hash does not match the event and with
    /// `MalformedBlock` on structural violations; the store is left untouched in both cases.
    pub fn add(&mut self, block: Block) -> Result<Admission> {
        self.add_at(block, Instant::now())
    }

    /// [`BlockStore::add`] with an explicit clock, used to stamp pending deadlines.
    pub fn add_at(&mut self, block: Block, now: Instant) -> Result<Admission> {
        block.verify_hash()?;
        block.validate()?;

        if self.contains(&block.hash) {
            return Ok(Admission::AlreadyExists);
        }
        if let Some(entry) = self.pending.get(&block.hash) {
            return Ok(Admission::Pending(entry.missing.clone()));
        }

        let missing = self.missing_for(&block);
        if !missing.is_empty() {
            debug!(block = block.short_hash(), missing = missing.len(), "Holding block until ancestors arrive");
            for evicted in self.pending.insert(block, missing.clone(), now) {
                warn!(block = evicted.short_hash(), "Pending index full, evicted oldest block");
            }
            return Ok(Admission::Pending(missing));
        }

        let hash = block.hash.clone();
        self.commit(block.clone())?;
        let mut committed = vec![block];

        let mut released = VecDeque::from([hash]);
        while let Some(arrived) = released.pop_front() {
            for ready in self.pending.release(&arrived) {
                let ready_hash = ready.hash.clone();
                match self.commit(ready.clone()) {
                    Ok(()) => {
                        debug!(block = short(&ready_hash), "Committed previously pending block");
                        released.push_back(ready_hash);
                        committed.push(ready);
                    }
                    Err(err) => {
                        warn!(block = short(&ready_hash), error = %err, "Dropping pending block");
                    }
                }
            }
        }

        Ok(Admission::Committed(committed))
    }

    /// Current tip set of `topic`, in lexicographic hash order.
    pub fn find_tip(&self, topic: &str) -> Result<Vec<BlockHash>> {
        self.tips
            .get(topic)
            .map(|tips| tips.iter().cloned().collect())
            .ok_or_else(|| HashgraphError::UnknownTopic(topic.to_string()))
    }

    /// Authors of every subscribe block in `topic`, plus the root ACL read and write lists.
    pub fn find_subscribers(&self, topic: &str) -> Result<BTreeSet<PeerId>> {
        let root = self.root_of(topic)?;
        let mut subscribers: BTreeSet<PeerId> = root.event.acl.peers().cloned().collect();

        let Some(root_idx) = self.node(topic) else {
            return Err(HashgraphError::UnknownTopic(topic.to_string()));
        };

        // Walk child edges outward from the root.
        let mut seen = HashSet::from([root_idx]);
        let mut queue = VecDeque::from([root_idx]);
        while let Some(idx) = queue.pop_front() {
            for child in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if !seen.insert(child) {
                    continue;
                }
                let block = &self.graph[child];
                if block.event.kind == EventType::Subscribe {
                    subscribers.insert(block.event.author.clone());
                }
                queue.push_back(child);
            }
        }

        Ok(subscribers)
    }

    /// Drops pending blocks whose deadline passed.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<Block> {
        self.pending.expire(now)
    }

    fn node(&self, hash: &str) -> Option<NodeIndex> {
        self.index_map.get(hash).map(|idx| *idx)
    }

    fn missing_for(&self, block: &Block) -> BTreeSet<BlockHash> {
        let mut missing: BTreeSet<BlockHash> = block
            .event
            .parents
            .iter()
            .filter(|parent| !self.contains(parent))
            .cloned()
            .collect();
        if !block.is_create() && !self.contains(&block.event.root) {
            missing.insert(block.event.root.clone());
        }
        missing
    }

    /// Inserts a block whose ancestors are all committed and advances its topic's tips.
    fn commit(&mut self, block: Block) -> Result<()> {
        if !block.is_create() {
            let topic = block.event.root.as_str();
            if self.root_of(topic).is_err() {
                return Err(HashgraphError::MalformedBlock(format!(
                    "root {} of block {} is not a graph.create block",
                    short(topic),
                    block.short_hash()
                )));
            }
            for parent in &block.event.parents {
                let parent_topic = self.get(parent)?.topic_id();
                if parent_topic != topic {
                    return Err(HashgraphError::MalformedBlock(format!(
                        "parent {} of block {} belongs to topic {}",
                        short(parent),
                        block.short_hash(),
                        short(parent_topic)
                    )));
                }
            }
        }

        let hash = block.hash.clone();
        let topic = block.topic_id().to_string();
        let mut links: Vec<BlockHash> = block.event.parents.iter().cloned().collect();
        if links.is_empty() && !block.is_create() {
            // A parentless append hangs off the root, which must still be the only tip.
            let root_is_sole_tip = self
                .tips
                .get(&topic)
                .is_some_and(|tips| tips.len() == 1 && tips.contains(&topic));
            if !root_is_sole_tip {
                return Err(HashgraphError::MalformedBlock(format!(
                    "block {} has no parents but topic {} already has appends",
                    block.short_hash(),
                    short(&topic)
                )));
            }
            links.push(topic.clone());
        }

        let node = self.graph.add_node(block);
        self.index_map.insert(hash.clone(), node);
        for link in &links {
            if let Some(parent_idx) = self.node(link) {
                self.graph.add_edge(node, parent_idx, ());
            }
        }

        let tips = self.tips.entry(topic).or_default();
        for link in &links {
            tips.remove(link);
        }
        tips.insert(hash);

        Ok(())
    }
}
