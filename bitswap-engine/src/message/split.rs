use bytes::Bytes;
use prost::encoding::{encoded_len_varint, int32, message};
use prost::Message;

use super::{pb, BitswapMessage};
use crate::error::Error;

/// Field tags of the top level protobuf message.
const TAG_WANTLIST: u32 = 1;
const TAG_PAYLOAD: u32 = 3;
const TAG_BLOCK_PRESENCES: u32 = 4;
const TAG_PENDING_BYTES: u32 = 5;

/// Field tags inside the wantlist.
const TAG_WANTLIST_ENTRIES: u32 = 1;
/// `full = true` costs a key byte and a value byte.
const FULL_FLAG_LEN: usize = 2;

/// Lazily splits a [`BitswapMessage`] into encoded frames.
///
/// Blocks go out first, then block presences, then wantlist entries. A frame is filled with
/// items in that order until the next item does not fit, then it is emitted. An item that is
/// bigger than a frame on its own is sent alone in an oversized frame.
#[derive(Debug)]
pub struct Frames<'a> {
    message: &'a BitswapMessage,
    max_frame_size: usize,
    next_block: usize,
    next_presence: usize,
    next_entry: usize,
    first: bool,
    done: bool,
}

impl<'a> Frames<'a> {
    pub(super) fn new(
        message: &'a BitswapMessage,
        max_frame_size: usize,
        max_block_size: usize,
    ) -> Result<Self, Error> {
        if let Some(block) = message
            .blocks()
            .find(|block| block.data.len() > max_block_size)
        {
            return Err(Error::BlockTooLarge {
                size: block.data.len(),
                max: max_block_size,
            });
        }

        Ok(Frames {
            message,
            max_frame_size,
            next_block: 0,
            next_presence: 0,
            next_entry: 0,
            first: true,
            done: false,
        })
    }
}

impl Iterator for Frames<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // `full` and `pending_bytes` describe the whole message, continuation frames must not
        // repeat them.
        let source = self.message;
        let mut frame = if self.first {
            FrameBuilder::new(source.full, source.pending_bytes)
        } else {
            FrameBuilder::new(false, 0)
        };
        self.first = false;

        let mut filled = false;

        let blocks = &source.blocks.items;
        while let Some(block) = blocks.get(self.next_block) {
            let item = pb::message::Block::from(block);
            let len = message::encoded_len(TAG_PAYLOAD, &item);
            if !frame.fits(len, 0, self.max_frame_size) {
                filled = true;
                break;
            }
            frame.push_block(item, len);
            self.next_block += 1;
        }

        if !filled {
            let presences = &source.block_presences.items;
            while let Some(presence) = presences.get(self.next_presence) {
                let item = pb::message::BlockPresence::from(presence);
                let len = message::encoded_len(TAG_BLOCK_PRESENCES, &item);
                if !frame.fits(len, 0, self.max_frame_size) {
                    filled = true;
                    break;
                }
                frame.push_presence(item, len);
                self.next_presence += 1;
            }
        }

        if !filled {
            let entries = &source.wantlist.items;
            while let Some(entry) = entries.get(self.next_entry) {
                let item = pb::message::wantlist::Entry::from(entry);
                let len = message::encoded_len(TAG_WANTLIST_ENTRIES, &item);
                if !frame.fits(0, len, self.max_frame_size) {
                    break;
                }
                frame.push_entry(item, len);
                self.next_entry += 1;
            }
        }

        self.done = self.next_block == blocks.len()
            && self.next_presence == source.block_presences.len()
            && self.next_entry == source.wantlist.len();

        Some(frame.finish())
    }
}

/// A single frame under construction, tracking its exact encoded length.
struct FrameBuilder {
    message: pb::Message,
    /// Encoded length of everything outside the wantlist field.
    outer_len: usize,
    /// Encoded length of the wantlist body.
    wantlist_len: usize,
    items: usize,
}

impl FrameBuilder {
    fn new(full: bool, pending_bytes: i32) -> Self {
        let outer_len = if pending_bytes != 0 {
            int32::encoded_len(TAG_PENDING_BYTES, &pending_bytes)
        } else {
            0
        };
        FrameBuilder {
            message: pb::Message {
                wantlist: Some(pb::message::Wantlist {
                    entries: Vec::new(),
                    full,
                }),
                pending_bytes,
                ..Default::default()
            },
            outer_len,
            wantlist_len: if full { FULL_FLAG_LEN } else { 0 },
            items: 0,
        }
    }

    fn len_with(&self, outer: usize, wantlist: usize) -> usize {
        let wantlist_len = self.wantlist_len + wantlist;
        let wantlist_field = prost::encoding::key_len(TAG_WANTLIST)
            + encoded_len_varint(wantlist_len as u64)
            + wantlist_len;
        self.outer_len + outer + wantlist_field
    }

    fn len(&self) -> usize {
        self.len_with(0, 0)
    }

    /// An empty frame takes any item, so oversized items still make progress.
    fn fits(&self, outer: usize, wantlist: usize, max_frame_size: usize) -> bool {
        self.items == 0 || self.len_with(outer, wantlist) <= max_frame_size
    }

    fn push_block(&mut self, block: pb::message::Block, len: usize) {
        self.message.payload.push(block);
        self.outer_len += len;
        self.items += 1;
    }

    fn push_presence(&mut self, presence: pb::message::BlockPresence, len: usize) {
        self.message.block_presences.push(presence);
        self.outer_len += len;
        self.items += 1;
    }

    fn push_entry(&mut self, entry: pb::message::wantlist::Entry, len: usize) {
        if let Some(wantlist) = self.message.wantlist.as_mut() {
            wantlist.entries.push(entry);
        }
        self.wantlist_len += len;
        self.items += 1;
    }

    fn finish(self) -> Bytes {
        let bytes = self.message.encode_to_vec();
        debug_assert_eq!(bytes.len(), self.len());
        bytes.into()
    }
}
