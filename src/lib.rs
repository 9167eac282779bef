//! Hashgraph: a per-topic causal block log replicated by gossip.
//!
//! Each topic is a DAG of immutable, content-addressed blocks hanging off one `graph.create`
//! block. Peers append blocks on top of the topic's current tips, gossip them to the topic's
//! audience (subscribers plus the ACL of the creating block) and admit what they receive only once
//! every ancestor is known locally.
//!
//! Architectural overview:
//! - [`block`] defines blocks, their content hash and the JSON wire codec.
//! - [`store`] is the committed DAG: idempotent admission, tip sets, subscriber lookup. Blocks that
//!   arrive before their ancestors wait in the [`pending`] index.
//! - [`hashgraph`] builds blocks for the local peer and notifies registered handlers.
//! - [`sync`] connects all of that to a [`transport::Transport`]: fan-out, backfill of missing
//!   ancestors, serving block requests. [`network`] provides a QUIC transport.
//!
//! Consistency is causal, not total: concurrent appends fork the topic into several tips, and the
//! next append lists all of them as parents.

pub mod block;
pub mod config;
pub mod error;
pub mod hashgraph;
pub mod network;
pub mod pending;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod transport;

pub use block::{Block, BlockEvent, BlockEventAcl, BlockHash, EventType, PeerId};
pub use config::SyncConfig;
pub use error::{HashgraphError, Result};
pub use hashgraph::{Hashgraph, NotifyReport, Outgoing};
pub use store::{Admission, BlockStore};
pub use sync::SyncAdapter;
pub use transport::{Inbound, MemoryNetwork, Transport};
