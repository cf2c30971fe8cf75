//! BlockSwap protocol messages
//!
//! Wire encoding uses prost derive structs; the engine operates on the
//! decoded [`BlockSwapMessage`] form. A message carries a wantlist (entries
//! the sender is missing, with priorities, or cancels) and a payload of
//! blocks, plus a `full` flag marking the wantlist as a complete resync.

use cid::Cid;
use prost::Message as ProstMessage;

use crate::cid_sha2::{parse_cid, CidError};
use crate::storage::Block;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("Invalid block in message: {0}")]
    Block(#[from] CidError),
}

/// Wire representation, kept separate from the decoded form
pub mod pb {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Message {
        #[prost(message, optional, tag = "1")]
        pub wantlist: Option<Wantlist>,

        #[prost(message, repeated, tag = "3")]
        pub payload: Vec<Block>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Wantlist {
        #[prost(message, repeated, tag = "1")]
        pub entries: Vec<Entry>,

        #[prost(bool, tag = "2")]
        pub full: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Entry {
        #[prost(bytes = "vec", tag = "1")]
        pub block: Vec<u8>,

        #[prost(int32, tag = "2")]
        pub priority: i32,

        #[prost(bool, tag = "3")]
        pub cancel: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Block {
        #[prost(bytes = "vec", tag = "1")]
        pub prefix: Vec<u8>,

        #[prost(bytes = "vec", tag = "2")]
        pub data: Vec<u8>,
    }
}

/// A single wantlist line on the wire: want this key at this priority, or
/// cancel a previous want for it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireEntry {
    pub key: Cid,
    pub priority: i32,
    pub cancel: bool,
}

/// Decoded BlockSwap message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockSwapMessage {
    full: bool,
    wantlist: Vec<WireEntry>,
    blocks: Vec<Block>,
}

impl BlockSwapMessage {
    /// Create an empty message. `full` marks the wantlist as a complete
    /// resync: the receiver replaces everything it knew about the sender's
    /// wants.
    pub fn new(full: bool) -> Self {
        Self {
            full,
            wantlist: Vec::new(),
            blocks: Vec::new(),
        }
    }

    pub fn full(&self) -> bool {
        self.full
    }

    pub fn wantlist(&self) -> &[WireEntry] {
        &self.wantlist
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.wantlist.is_empty() && self.blocks.is_empty()
    }

    /// Add a want entry for `key`
    pub fn want(&mut self, key: Cid, priority: i32) {
        self.wantlist.push(WireEntry {
            key,
            priority,
            cancel: false,
        });
    }

    /// Add a cancel entry for `key`
    pub fn cancel(&mut self, key: Cid) {
        self.wantlist.push(WireEntry {
            key,
            priority: 0,
            cancel: true,
        });
    }

    /// Add a block to the payload
    pub fn add_block(&mut self, block: Block) {
        self.blocks.push(block);
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let wire = self.to_wire();
        let mut buf = Vec::with_capacity(wire.encoded_len());
        wire.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode from wire bytes. Payload blocks are re-addressed from their
    /// data; a block whose bytes cannot be addressed fails the whole message.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_wire(pb::Message::decode(bytes)?)
    }

    pub fn to_wire(&self) -> pb::Message {
        let wantlist = if self.wantlist.is_empty() && !self.full {
            None
        } else {
            Some(pb::Wantlist {
                entries: self
                    .wantlist
                    .iter()
                    .map(|e| pb::Entry {
                        block: e.key.to_bytes(),
                        priority: e.priority,
                        cancel: e.cancel,
                    })
                    .collect(),
                full: self.full,
            })
        };

        pb::Message {
            wantlist,
            payload: self
                .blocks
                .iter()
                .map(|b| pb::Block {
                    prefix: b.cid.to_bytes()[0..4].to_vec(),
                    data: b.data.clone(),
                })
                .collect(),
        }
    }

    pub fn from_wire(wire: pb::Message) -> Result<Self, MessageError> {
        let (entries, full) = match wire.wantlist {
            Some(wl) => (wl.entries, wl.full),
            None => (Vec::new(), false),
        };

        let mut wantlist = Vec::with_capacity(entries.len());
        for entry in entries {
            wantlist.push(WireEntry {
                key: parse_cid(&entry.block)?,
                priority: entry.priority,
                cancel: entry.cancel,
            });
        }

        let mut blocks = Vec::with_capacity(wire.payload.len());
        for block in wire.payload {
            blocks.push(Block::new(block.data)?);
        }

        Ok(Self {
            full,
            wantlist,
            blocks,
        })
    }
}
