use serde::{Deserialize, Serialize};

use crate::block::{self, Block, BlockHash};
use crate::error::{HashgraphError, Result};

pub const PROTOCOL_ID: &str = "/hashgraph/v1";
/// A single encoded block.
pub const EVENT_MESSAGE_TYPE: &str = "/hashgraph/v1/event";
/// A JSON array of block hashes the sender wants.
pub const REQUEST_MESSAGE_TYPE: &str = "/hashgraph/v1/request";

/// Typed frame handed to the transport. The transport routes on `message_type` and never looks
/// inside `payload`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Event(Block),
    Request(Vec<BlockHash>),
}

impl ProtocolMessage {
    pub fn to_envelope(&self) -> Result<Envelope> {
        match self {
            ProtocolMessage::Event(block) => Ok(Envelope {
                message_type: EVENT_MESSAGE_TYPE.to_string(),
                payload: block::encode(block)?,
            }),
            ProtocolMessage::Request(hashes) => Ok(Envelope {
                message_type: REQUEST_MESSAGE_TYPE.to_string(),
                payload: serde_json::to_vec(hashes)
                    .map_err(|e| HashgraphError::MalformedBlock(e.to_string()))?,
            }),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        match envelope.message_type.as_str() {
            EVENT_MESSAGE_TYPE => Ok(ProtocolMessage::Event(block::decode(&envelope.payload)?)),
            REQUEST_MESSAGE_TYPE => serde_json::from_slice(&envelope.payload)
                .map(ProtocolMessage::Request)
                .map_err(|e| HashgraphError::MalformedBlock(e.to_string())),
            other => Err(HashgraphError::UnknownMessageType(other.to_string())),
        }
    }
}
