use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::block::{Block, BlockHash};

/// Expiry entry for a pending block.
///
/// Entries are never removed from the heap eagerly; an entry whose block was released (or was
/// re-inserted with a later deadline) is skipped when popped.
#[derive(Debug, Clone)]
struct Deadline {
    expires_at: Instant,
    hash: BlockHash,
}

impl Eq for Deadline {}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at.eq(&other.expires_at) && self.hash == other.hash
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest deadline pops first.
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.hash.cmp(&self.hash))
    }
}

/// A block withheld from commit until its ancestors arrive.
#[derive(Debug, Clone)]
pub struct PendingBlock {
    pub block: Block,
    /// Ancestors not yet committed.
    pub missing: BTreeSet<BlockHash>,
    pub expires_at: Instant,
}

/// Blocks waiting on missing ancestors, indexed by the ancestor they wait on.
///
/// Bounded two ways: every entry expires after `ttl`, and at most `capacity` entries are held
/// (inserting into a full index evicts the entry closest to expiry).
#[derive(Debug)]
pub struct PendingIndex {
    blocks: HashMap<BlockHash, PendingBlock>,
    waiting_on: HashMap<BlockHash, BTreeSet<BlockHash>>,
    deadlines: BinaryHeap<Deadline>,
    ttl: Duration,
    capacity: usize,
}

impl PendingIndex {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            waiting_on: HashMap::new(),
            deadlines: BinaryHeap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&PendingBlock> {
        self.blocks.get(hash)
    }

    /// Every ancestor hash some pending block is waiting on.
    pub fn missing(&self) -> BTreeSet<BlockHash> {
        self.waiting_on.keys().cloned().collect()
    }

    /// Holds `block` until every hash in `missing` has been released.
    ///
    /// Returns the blocks evicted to make room.
    pub fn insert(&mut self, block: Block, missing: BTreeSet<BlockHash>, now: Instant) -> Vec<Block> {
        let mut evicted = Vec::new();
        if self.blocks.contains_key(&block.hash) {
            return evicted;
        }

        while self.blocks.len() >= self.capacity {
            match self.deadlines.pop() {
                Some(deadline) => {
                    if self.is_live(&deadline) {
                        if let Some(entry) = self.remove(&deadline.hash) {
                            evicted.push(entry.block);
                        }
                    }
                }
                None => break,
            }
        }

        let hash = block.hash.clone();
        let expires_at = now + self.ttl;
        for ancestor in &missing {
            self.waiting_on
                .entry(ancestor.clone())
                .or_default()
                .insert(hash.clone());
        }
        self.deadlines.push(Deadline {
            expires_at,
            hash: hash.clone(),
        });
        self.blocks.insert(
            hash,
            PendingBlock {
                block,
                missing,
                expires_at,
            },
        );
        self.compact();

        evicted
    }

    /// Records that `arrived` is now committed.
    ///
    /// Returns the blocks that no longer miss anything, removed from the index.
    pub fn release(&mut self, arrived: &str) -> Vec<Block> {
        let Some(waiters) = self.waiting_on.remove(arrived) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for waiter in waiters {
            let complete = match self.blocks.get_mut(&waiter) {
                Some(entry) => {
                    entry.missing.remove(arrived);
                    entry.missing.is_empty()
                }
                None => false,
            };
            if complete {
                if let Some(entry) = self.blocks.remove(&waiter) {
                    ready.push(entry.block);
                }
            }
        }
        ready
    }

    /// Drops every entry whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<Block> {
        let mut expired = Vec::new();
        while let Some(top) = self.deadlines.peek() {
            if top.expires_at > now {
                break;
            }
            let Some(deadline) = self.deadlines.pop() else {
                break;
            };
            if self.is_live(&deadline) {
                if let Some(entry) = self.remove(&deadline.hash) {
                    expired.push(entry.block);
                }
            }
        }
        expired
    }

    fn is_live(&self, deadline: &Deadline) -> bool {
        self.blocks
            .get(&deadline.hash)
            .is_some_and(|entry| entry.expires_at == deadline.expires_at)
    }

    fn remove(&mut self, hash: &str) -> Option<PendingBlock> {
        let entry = self.blocks.remove(hash)?;
        for ancestor in &entry.missing {
            if let Some(waiters) = self.waiting_on.get_mut(ancestor) {
                waiters.remove(hash);
                if waiters.is_empty() {
                    self.waiting_on.remove(ancestor);
                }
            }
        }
        Some(entry)
    }

    // Released entries leave their deadlines behind; rebuild once stale ones dominate.
    fn compact(&mut self) {
        if self.deadlines.len() > 2 * self.blocks.len() + 64 {
            let blocks = &self.blocks;
            self.deadlines.retain(|deadline| {
                blocks
                    .get(&deadline.hash)
                    .is_some_and(|entry| entry.expires_at == deadline.expires_at)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockEventAcl, EventType};

    fn child_of(root: &Block, parents: &[&str]) -> Block {
        Block::child(
            "peer".into(),
            root.hash.clone(),
            parents.iter().map(|p| p.to_string()).collect(),
            EventType::Append,
            String::new(),
        )
    }

    fn set(hashes: &[&str]) -> BTreeSet<BlockHash> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn releases_only_when_every_ancestor_arrived() {
        let root = Block::create("peer".into(), BlockEventAcl::default());
        let block = child_of(&root, &["a", "b"]);
        let mut index = PendingIndex::new(Duration::from_secs(10), 8);

        index.insert(block.clone(), set(&["a", "b"]), Instant::now());
        assert_eq!(index.missing(), set(&["a", "b"]));

        assert!(index.release("a").is_empty(), "still waiting on b");
        assert!(index.contains(&block.hash));

        let ready = index.release("b");
        assert_eq!(ready, vec![block.clone()]);
        assert!(index.is_empty());
        assert!(index.missing().is_empty());
    }

    #[test]
    fn expired_blocks_are_dropped() {
        let root = Block::create("peer".into(), BlockEventAcl::default());
        let block = child_of(&root, &["a"]);
        let mut index = PendingIndex::new(Duration::from_secs(5), 8);
        let start = Instant::now();

        index.insert(block.clone(), set(&["a"]), start);
        assert!(index.expire(start + Duration::from_secs(4)).is_empty());

        let expired = index.expire(start + Duration::from_secs(5));
        assert_eq!(expired, vec![block]);
        assert!(index.is_empty());
        assert!(index.missing().is_empty(), "ancestor index is reclaimed too");
        assert!(index.release("a").is_empty());
    }

    #[test]
    fn full_index_evicts_oldest() {
        let root = Block::create("peer".into(), BlockEventAcl::default());
        let first = child_of(&root, &["a"]);
        let second = child_of(&root, &["b"]);
        let third = child_of(&root, &["c"]);
        let mut index = PendingIndex::new(Duration::from_secs(5), 2);
        let start = Instant::now();

        index.insert(first.clone(), set(&["a"]), start);
        index.insert(second.clone(), set(&["b"]), start + Duration::from_millis(1));
        let evicted = index.insert(third.clone(), set(&["c"]), start + Duration::from_millis(2));

        assert_eq!(evicted, vec![first.clone()]);
        assert_eq!(index.len(), 2);
        assert!(!index.contains(&first.hash));
        assert_eq!(index.missing(), set(&["b", "c"]));
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let root = Block::create("peer".into(), BlockEventAcl::default());
        let block = child_of(&root, &["a"]);
        let mut index = PendingIndex::new(Duration::from_secs(5), 4);
        let start = Instant::now();

        index.insert(block.clone(), set(&["a"]), start);
        index.insert(block.clone(), set(&["a"]), start + Duration::from_secs(3));
        assert_eq!(index.len(), 1);
        assert_eq!(index.get(&block.hash).map(|p| p.expires_at), Some(start + Duration::from_secs(5)));
    }
}
