use core::convert::TryFrom;
use std::fmt::{self, Debug};

use ahash::AHashMap;
use bytes::Bytes;
use cid::Cid;
use prost::Message;

use crate::block::{Block, BlockKey};
use crate::error::Error;
use crate::prefix::Prefix;

mod pb;
mod split;

pub use self::split::Frames;

/// Priority of a wanted block.
pub type Priority = i32;

/// Represents a HAVE / DONT_HAVE for a given Cid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPresence {
    pub cid: Cid,
    pub typ: BlockPresenceType,
}

impl From<&BlockPresence> for pb::message::BlockPresence {
    fn from(bp: &BlockPresence) -> Self {
        pb::message::BlockPresence {
            cid: bp.cid.to_bytes(),
            r#type: bp.typ.into(),
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

// A wantlist entry in a Bitswap message, with flags indicating
// - whether message is a cancel
// - whether requester wants a DONT_HAVE message
// - whether requester wants a HAVE message (instead of the block)
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("want_type", &self.want_type)
            .field("cancel", &self.cancel)
            .field("send_dont_have", &self.send_dont_have)
            .finish()
    }
}

impl From<&Entry> for pb::message::wantlist::Entry {
    fn from(e: &Entry) -> Self {
        pb::message::wantlist::Entry {
            block: e.cid.to_bytes(),
            priority: e.priority,
            want_type: e.want_type.into(),
            cancel: e.cancel,
            send_dont_have: e.send_dont_have,
        }
    }
}

impl From<&Block> for pb::message::Block {
    fn from(block: &Block) -> Self {
        pb::message::Block {
            prefix: Prefix::from(block.cid()).to_bytes(),
            data: block.data().clone(),
        }
    }
}

/// A list of items addressable by their [`BlockKey`], keeping insertion order.
#[derive(Clone, PartialEq, Eq)]
struct Keyed<T> {
    items: Vec<T>,
    index: AHashMap<BlockKey, usize>,
}

impl<T> Default for Keyed<T> {
    fn default() -> Self {
        Keyed {
            items: Vec::new(),
            index: AHashMap::new(),
        }
    }
}

impl<T> Keyed<T> {
    fn get_mut(&mut self, key: &BlockKey) -> Option<&mut T> {
        let i = *self.index.get(key)?;
        self.items.get_mut(i)
    }

    fn contains(&self, key: &BlockKey) -> bool {
        self.index.contains_key(key)
    }

    /// Replaces an existing item with the same key in place, or appends.
    fn insert(&mut self, key: BlockKey, item: T) {
        match self.index.get(&key) {
            Some(i) => self.items[*i] = item,
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(item);
            }
        }
    }

    fn remove(&mut self, key: &BlockKey) -> Option<T> {
        let i = self.index.remove(key)?;
        let item = self.items.remove(i);
        for pos in self.index.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        Some(item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }
}

/// A bitswap message.
///
/// Items of each category keep the order in which they were added. A CID (by multihash) is
/// present at most once per category, and never as both a block and a presence.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: Keyed<Entry>,
    blocks: Keyed<Block>,
    block_presences: Keyed<BlockPresence>,
    pending_bytes: i32,
}

struct Fmt<F>(pub F)
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result;

impl<F> fmt::Debug for Fmt<F>
where
    F: Fn(&mut fmt::Formatter) -> fmt::Result,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        (self.0)(f)
    }
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field("wantlist", &Fmt(|f| f.debug_list().entries(self.wantlist.iter()).finish()))
            .field(
                "blocks",
                &Fmt(|f| {
                    let mut blocks = f.debug_map();
                    for block in self.blocks.iter() {
                        blocks.entry(&block.cid.to_string(), &block.data.len());
                    }
                    blocks.finish()
                }),
            )
            .field(
                "block_presences",
                &Fmt(|f| {
                    let mut block_presences = f.debug_map();
                    for bp in self.block_presences.iter() {
                        block_presences.entry(&bp.cid.to_string(), &bp.typ);
                    }
                    block_presences.finish()
                }),
            )
            .field("pending_bytes", &self.pending_bytes)
            .finish()
    }
}

impl BitswapMessage {
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    /// Whether the wantlist in this message replaces the receiver's view of our wantlist.
    pub fn full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.wantlist.is_empty() && self.block_presences.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.iter()
    }

    pub fn wantlist_len(&self) -> usize {
        self.wantlist.len()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// Total number of block data bytes carried by this message.
    pub fn block_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    pub fn block_presences(&self) -> impl Iterator<Item = &BlockPresence> {
        self.block_presences.iter()
    }

    pub fn block_presences_len(&self) -> usize {
        self.block_presences.len()
    }

    pub fn haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::Have)
    }

    pub fn dont_haves(&self) -> impl Iterator<Item = &Cid> {
        self.get_block_presence_by_type(BlockPresenceType::DontHave)
    }

    fn get_block_presence_by_type(&self, typ: BlockPresenceType) -> impl Iterator<Item = &Cid> {
        self.block_presences
            .iter()
            .filter_map(move |bp| (bp.typ == typ).then_some(&bp.cid))
    }

    pub fn pending_bytes(&self) -> i32 {
        self.pending_bytes
    }

    pub fn set_pending_bytes(&mut self, bytes: i32) {
        self.pending_bytes = bytes;
    }

    pub fn cancel(&mut self, cid: Cid) {
        self.add_full_entry(cid, 0, true, WantType::Block, false)
    }

    pub fn add_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        want_type: WantType,
        send_dont_have: bool,
    ) {
        self.add_full_entry(cid, priority, false, want_type, send_dont_have)
    }

    fn add_full_entry(
        &mut self,
        cid: Cid,
        priority: Priority,
        cancel: bool,
        want_type: WantType,
        send_dont_have: bool,
    ) {
        let key = BlockKey::from(&cid);
        if let Some(entry) = self.wantlist.get_mut(&key) {
            // only change priority if want is of the same type
            if entry.want_type == want_type {
                entry.priority = priority;
            }

            // only change from dont cancel to cancel
            if cancel {
                entry.cancel = cancel;
            }

            // only change from dont send to do send DONT_HAVE
            if send_dont_have {
                entry.send_dont_have = send_dont_have;
            }

            // want block overrides existing want have
            if want_type == WantType::Block && entry.want_type == WantType::Have {
                entry.want_type = want_type;
            }

            return;
        }

        self.wantlist.insert(
            key,
            Entry {
                cid,
                priority,
                want_type,
                send_dont_have,
                cancel,
            },
        );
    }

    pub fn add_block(&mut self, block: Block) {
        let key = block.key();
        self.block_presences.remove(&key);
        self.blocks.insert(key, block);
    }

    pub fn add_block_presence(&mut self, cid: Cid, typ: BlockPresenceType) {
        let key = BlockKey::from(&cid);
        if self.blocks.contains(&key) {
            return;
        }
        self.block_presences.insert(key, BlockPresence { cid, typ });
    }

    pub fn add_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::Have);
    }

    pub fn add_dont_have(&mut self, cid: Cid) {
        self.add_block_presence(cid, BlockPresenceType::DontHave);
    }

    /// Splits this message into wire frames of at most `max_frame_size` bytes.
    ///
    /// Fails if any block is larger than `max_block_size`, no frame could ever carry it.
    pub fn frames(&self, max_frame_size: usize, max_block_size: usize) -> Result<Frames<'_>, Error> {
        Frames::new(self, max_frame_size, max_block_size)
    }

    /// Encodes the whole message as a single protobuf frame, without any size limit.
    pub fn encode(&self) -> Bytes {
        self.encode_as_proto_v1().encode_to_vec().into()
    }

    fn encode_as_proto_v1(&self) -> pb::Message {
        pb::Message {
            wantlist: Some(pb::message::Wantlist {
                entries: self.wantlist.iter().map(Into::into).collect(),
                full: self.full,
            }),
            blocks: Vec::new(),
            payload: self.blocks.iter().map(Into::into).collect(),
            block_presences: self.block_presences.iter().map(Into::into).collect(),
            pending_bytes: self.pending_bytes,
        }
    }
}

impl TryFrom<pb::Message> for BitswapMessage {
    type Error = Error;

    fn try_from(pbm: pb::Message) -> Result<Self, Self::Error> {
        let full = pbm.wantlist.as_ref().map(|w| w.full).unwrap_or_default();
        let mut message = BitswapMessage::new(full);

        if let Some(wantlist) = pbm.wantlist {
            for entry in wantlist.entries {
                let cid = Cid::try_from(entry.block)?;
                message.add_full_entry(
                    cid,
                    entry.priority,
                    entry.cancel,
                    entry.want_type.try_into()?,
                    entry.send_dont_have,
                );
            }
        }

        // deprecated
        for data in pbm.blocks {
            let block = Block::from_v0_data(data)?;
            message.add_block(block);
        }

        for block in pbm.payload {
            let prefix = Prefix::new(&block.prefix)?;
            let cid = prefix.to_cid(&block.data)?;
            message.add_block(Block::new(block.data, cid));
        }

        for block_presence in pbm.block_presences {
            let cid = Cid::try_from(block_presence.cid)?;
            message.add_block_presence(cid, block_presence.r#type.try_into()?);
        }

        message.pending_bytes = pbm.pending_bytes;

        Ok(message)
    }
}

impl TryFrom<Bytes> for BitswapMessage {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self, Self::Error> {
        let pbm = pb::Message::decode(value)?;
        pbm.try_into()
    }
}
