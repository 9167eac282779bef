//! Content-addressed hashgraph blocks and their wire codec.
//!
//! A block is the unit of replication: peers gossip blocks and rebuild each topic's DAG locally.
//! Blocks are immutable once hashed. The hash covers the `event` object only; `signature` and
//! `hash` sit outside of it so an authenticity proof can later be attached over the hash without
//! changing block identity.
//!
//! The wire form is JSON:
//!
//! ```text
//! {"event":{"root","acl":{"read","write"},"author","data","nonce","parents","type"},"signature","hash"}
//! ```

use std::collections::BTreeSet;
use std::fmt;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{HashgraphError, Result};

/// Hex-encoded BLAKE3 digest identifying a block. Topic ids are the hash of the topic's
/// `graph.create` block.
pub type BlockHash = String;

/// Opaque peer identifier, as handed to us by the transport.
pub type PeerId = String;

pub const EVENT_TYPE_GRAPH_CREATE: &str = "graph.create";
pub const EVENT_TYPE_GRAPH_APPEND: &str = "graph.append";
pub const EVENT_TYPE_GRAPH_SUBSCRIBE: &str = "graph.subscribe";

/// What a block means for its topic.
///
/// Callers may append blocks with their own type strings; those round-trip as `Custom`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Create,
    Append,
    Subscribe,
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Create => EVENT_TYPE_GRAPH_CREATE,
            EventType::Append => EVENT_TYPE_GRAPH_APPEND,
            EventType::Subscribe => EVENT_TYPE_GRAPH_SUBSCRIBE,
            EventType::Custom(kind) => kind,
        }
    }
}

impl From<String> for EventType {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            EVENT_TYPE_GRAPH_CREATE => EventType::Create,
            EVENT_TYPE_GRAPH_APPEND => EventType::Append,
            EVENT_TYPE_GRAPH_SUBSCRIBE => EventType::Subscribe,
            _ => EventType::Custom(kind),
        }
    }
}

impl From<EventType> for String {
    fn from(kind: EventType) -> Self {
        match kind {
            EventType::Custom(kind) => kind,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read/write peer lists of a topic. Only meaningful on the `graph.create` block.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockEventAcl {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read: Vec<PeerId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub write: Vec<PeerId>,
}

impl BlockEventAcl {
    pub fn new(read: Vec<PeerId>, write: Vec<PeerId>) -> Self {
        Self { read, write }
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }

    /// Every peer named by the ACL, read and write alike.
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.read.iter().chain(self.write.iter())
    }
}

/// The hashed payload of a block.
///
/// Field order is the canonical order; the content hash is taken over the JSON encoding of this
/// struct, so reordering fields changes every block id.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockEvent {
    /// Hash of the topic's `graph.create` block. Empty only on the create block itself.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root: BlockHash,
    #[serde(default)]
    pub acl: BlockEventAcl,
    pub author: PeerId,
    #[serde(default)]
    pub data: String,
    /// Random string keeping otherwise identical events (e.g. two empty subscribes) distinct.
    #[serde(default)]
    pub nonce: String,
    /// Direct causal predecessors within the topic.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub parents: BTreeSet<BlockHash>,
    #[serde(rename = "type")]
    pub kind: EventType,
}

/// Immutable, content-addressed unit of a topic's log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub event: BlockEvent,
    /// Reserved for an authenticity proof. Never produced or checked by this crate.
    #[serde(default)]
    pub signature: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hash: BlockHash,
}

impl Block {
    /// Wraps an event into a block and computes its content hash.
    pub fn new(event: BlockEvent) -> Self {
        let hash = hash_event(&event);
        Self {
            event,
            signature: String::new(),
            hash,
        }
    }

    /// Builds the `graph.create` block of a new topic.
    pub fn create(author: PeerId, acl: BlockEventAcl) -> Self {
        Self::new(BlockEvent {
            root: String::new(),
            acl,
            author,
            data: String::new(),
            nonce: new_nonce(),
            parents: BTreeSet::new(),
            kind: EventType::Create,
        })
    }

    /// Builds a block extending topic `root` on top of `parents`.
    pub fn child(
        author: PeerId,
        root: BlockHash,
        parents: BTreeSet<BlockHash>,
        kind: EventType,
        data: String,
    ) -> Self {
        Self::new(BlockEvent {
            root,
            acl: BlockEventAcl::default(),
            author,
            data,
            nonce: new_nonce(),
            parents,
            kind,
        })
    }

    pub fn is_create(&self) -> bool {
        self.event.kind == EventType::Create
    }

    /// The topic this block belongs to: its own hash for a create block, `root` otherwise.
    pub fn topic_id(&self) -> &str {
        if self.is_create() {
            &self.hash
        } else {
            &self.event.root
        }
    }

    /// Recomputes the content hash and compares it with the transmitted one.
    pub fn verify_hash(&self) -> Result<()> {
        let computed = hash_event(&self.event);
        if computed != self.hash {
            return Err(HashgraphError::IntegrityError {
                claimed: self.hash.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Structural checks that need no store access.
    pub fn validate(&self) -> Result<()> {
        if self.hash.is_empty() {
            return Err(HashgraphError::MalformedBlock("missing hash".into()));
        }
        if self.event.author.is_empty() {
            return Err(HashgraphError::MalformedBlock("missing author".into()));
        }
        if self.event.kind.as_str().is_empty() {
            return Err(HashgraphError::MalformedBlock("missing event type".into()));
        }
        if self.is_create() {
            if !self.event.root.is_empty() || !self.event.parents.is_empty() {
                return Err(HashgraphError::MalformedBlock(format!(
                    "{} block {} must not have a root or parents",
                    EVENT_TYPE_GRAPH_CREATE, self.hash
                )));
            }
        } else if self.event.root.is_empty() {
            return Err(HashgraphError::MalformedBlock(format!(
                "{} block {} has no root",
                self.event.kind, self.hash
            )));
        }
        if self.event.parents.contains(&self.hash) {
            return Err(HashgraphError::MalformedBlock(format!("block {} lists itself as parent", self.hash)));
        }
        Ok(())
    }

    /// Abbreviated hash for log lines.
    pub fn short_hash(&self) -> &str {
        short(&self.hash)
    }
}

/// Deterministic content hash of an event, hex encoded.
pub fn hash_event(event: &BlockEvent) -> BlockHash {
    let mut hasher = Hasher::new();
    let canonical = serde_json::to_vec(event).expect("Failed to serialize event for hashing");
    hasher.update(&canonical);
    hasher.finalize().to_hex().to_string()
}

/// Encodes a block into its JSON wire form.
pub fn encode(block: &Block) -> Result<Vec<u8>> {
    serde_json::to_vec(block).map_err(|e| HashgraphError::MalformedBlock(e.to_string()))
}

/// Decodes and structurally validates a block. Integrity is checked on admission, not here.
pub fn decode(bytes: &[u8]) -> Result<Block> {
    let block: Block =
        serde_json::from_slice(bytes).map_err(|e| HashgraphError::MalformedBlock(e.to_string()))?;
    block.validate()?;
    Ok(block)
}

pub(crate) fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_topic() -> (Block, Block) {
        let root = Block::create(
            "peer-owner".into(),
            BlockEventAcl::new(vec!["reader".into()], vec!["writer".into()]),
        );
        let parents: BTreeSet<_> = [root.hash.clone()].into_iter().collect();
        let append = Block::child(
            "peer-owner".into(),
            root.hash.clone(),
            parents,
            EventType::Append,
            "hello".into(),
        );
        (root, append)
    }

    #[test]
    fn encode_decode_round_trips() {
        let (root, append) = sample_topic();
        for block in [root, append] {
            let bytes = encode(&block).expect("encode");
            let decoded = decode(&bytes).expect("decode");
            assert_eq!(decoded, block);
            decoded.verify_hash().expect("hash survives the wire");
        }
    }

    #[test]
    fn hash_is_deterministic_and_tamper_evident() {
        let (_, append) = sample_topic();
        assert_eq!(hash_event(&append.event), append.hash);
        assert_eq!(append.hash.len(), 64);

        let mut tampered = append.clone();
        tampered.event.data = "goodbye".into();
        assert!(matches!(
            tampered.verify_hash(),
            Err(HashgraphError::IntegrityError { .. })
        ));

        let mut reauthored = append.clone();
        reauthored.event.author = "mallory".into();
        assert_ne!(hash_event(&reauthored.event), append.hash);
    }

    #[test]
    fn signature_is_outside_the_hash() {
        let (_, mut append) = sample_topic();
        append.signature = "sig".into();
        append.verify_hash().expect("signature does not affect identity");
    }

    #[test]
    fn nonce_separates_identical_events() {
        let a = Block::create("peer".into(), BlockEventAcl::default());
        let b = Block::create("peer".into(), BlockEventAcl::default());
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn wire_format_uses_expected_field_names() {
        let (root, append) = sample_topic();
        let root_json: serde_json::Value = serde_json::from_slice(&encode(&root).unwrap()).unwrap();
        assert_eq!(root_json["event"]["type"], "graph.create");
        assert_eq!(root_json["event"]["acl"]["read"][0], "reader");
        assert!(root_json["event"].get("root").is_none());
        assert!(root_json["event"].get("parents").is_none());
        assert_eq!(root_json["signature"], "");
        assert_eq!(root_json["hash"], root.hash.as_str());

        let append_json: serde_json::Value = serde_json::from_slice(&encode(&append).unwrap()).unwrap();
        assert_eq!(append_json["event"]["root"], root.hash.as_str());
        assert_eq!(append_json["event"]["parents"][0], root.hash.as_str());
        assert_eq!(append_json["event"]["type"], "graph.append");
    }

    #[test]
    fn custom_event_types_survive() {
        let (root, _) = sample_topic();
        let parents: BTreeSet<_> = [root.hash.clone()].into_iter().collect();
        let block = Block::child(
            "peer".into(),
            root.hash.clone(),
            parents,
            EventType::from("chat.message".to_string()),
            "hi".into(),
        );
        let decoded = decode(&encode(&block).unwrap()).unwrap();
        assert_eq!(decoded.event.kind, EventType::Custom("chat.message".into()));
        assert_eq!(decoded.event.kind.to_string(), "chat.message");
    }

    #[test]
    fn decode_rejects_malformed_input() {
        assert!(matches!(decode(b"not json"), Err(HashgraphError::MalformedBlock(_))));

        // Missing author.
        let missing_author = br#"{"event":{"data":"","nonce":"n","type":"graph.create"},"signature":"","hash":"ab"}"#;
        assert!(matches!(decode(missing_author), Err(HashgraphError::MalformedBlock(_))));

        // Missing hash.
        let missing_hash = br#"{"event":{"author":"a","data":"","nonce":"n","type":"graph.create"},"signature":""}"#;
        assert!(matches!(decode(missing_hash), Err(HashgraphError::MalformedBlock(_))));

        // An append without a root.
        let (_, mut orphan) = sample_topic();
        orphan.event.root.clear();
        orphan.hash = hash_event(&orphan.event);
        let bytes = encode(&orphan).unwrap();
        assert!(matches!(decode(&bytes), Err(HashgraphError::MalformedBlock(_))));

        // A create block with parents.
        let (root, append) = sample_topic();
        let mut create = root.clone();
        create.event.parents.insert(append.hash.clone());
        create.hash = hash_event(&create.event);
        let bytes = encode(&create).unwrap();
        assert!(matches!(decode(&bytes), Err(HashgraphError::MalformedBlock(_))));
    }

    #[test]
    fn topic_id_points_at_root() {
        let (root, append) = sample_topic();
        assert_eq!(root.topic_id(), root.hash);
        assert_eq!(append.topic_id(), root.hash);
    }
}
