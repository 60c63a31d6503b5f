use std::time::Instant;

use ahash::AHashMap;
use cid::Cid;
use libp2p_identity::PeerId;
use tracing::trace;

use crate::block::{Block, BlockKey};
use crate::error::Error;
use crate::message::{BitswapMessage, Entry, Priority, WantType};
use crate::network::{Network, Transport};
use crate::Store;

/// A block a remote peer wants from us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerWantListEntry {
    pub cid: Cid,
    pub priority: Priority,
    pub want_type: WantType,
    pub send_dont_have: bool,
    /// A DONT_HAVE was already sent for this want.
    pub sent_dont_have: bool,
}

impl From<&Entry> for PeerWantListEntry {
    fn from(entry: &Entry) -> Self {
        PeerWantListEntry {
            cid: entry.cid,
            priority: entry.priority,
            want_type: entry.want_type,
            send_dont_have: entry.send_dont_have,
            sent_dont_have: false,
        }
    }
}

/// A summary of the ledger for the given peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub peer: PeerId,
    /// The debt ratio, bytes sent over bytes received.
    pub value: f64,
    pub sent: u64,
    pub recv: u64,
    pub exchanged: u64,
}

/// Tracks the want list of a remote peer and what we exchanged with it.
#[derive(Debug)]
pub struct Ledger<S, T> {
    /// The remote peer.
    partner: PeerId,
    store: S,
    network: Network<T>,
    /// Blocks below this size are sent in place of a HAVE.
    max_size_replace_has_with_block: usize,
    wants: AHashMap<BlockKey, PeerWantListEntry>,
    exchange_count: u64,
    bytes_sent: u64,
    bytes_recv: u64,
    last_exchange: Option<Instant>,
}

impl<S: Store, T: Transport> Ledger<S, T> {
    pub fn new(
        partner: PeerId,
        store: S,
        network: Network<T>,
        max_size_replace_has_with_block: usize,
    ) -> Self {
        Ledger {
            partner,
            store,
            network,
            max_size_replace_has_with_block,
            wants: Default::default(),
            exchange_count: 0,
            bytes_sent: 0,
            bytes_recv: 0,
            last_exchange: None,
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    pub fn sent_bytes(&mut self, n: usize) {
        self.exchange_count += 1;
        self.last_exchange = Some(Instant::now());
        self.bytes_sent += n as u64;
    }

    pub fn received_bytes(&mut self, n: usize) {
        self.exchange_count += 1;
        self.last_exchange = Some(Instant::now());
        self.bytes_recv += n as u64;
    }

    pub fn debt_ratio(&self) -> f64 {
        self.bytes_sent as f64 / (self.bytes_recv as f64 + 1.)
    }

    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    pub fn receipt(&self) -> Receipt {
        Receipt {
            peer: self.partner,
            value: self.debt_ratio(),
            sent: self.bytes_sent,
            recv: self.bytes_recv,
            exchanged: self.exchange_count,
        }
    }

    /// Records or replaces a want.
    pub fn wants(&mut self, entry: PeerWantListEntry) {
        self.wants.insert(BlockKey::from(&entry.cid), entry);
    }

    pub fn cancel_want(&mut self, cid: &Cid) -> Option<PeerWantListEntry> {
        self.wants.remove(&BlockKey::from(cid))
    }

    pub fn clear_wants(&mut self) {
        self.wants.clear();
    }

    pub fn wants_block(&self, key: &BlockKey) -> bool {
        self.wants.contains_key(key)
    }

    /// The wants of the peer, highest priority first.
    pub fn entries(&self) -> Vec<PeerWantListEntry> {
        let mut entries: Vec<_> = self.wants.values().cloned().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        entries
    }

    /// Answers every want we can: blocks, HAVEs and, where asked for, a single DONT_HAVE.
    ///
    /// Wants answered with a block are dropped afterwards, the peer asks again if it still
    /// needs them. A store failure other than a miss aborts the flush.
    pub async fn send_blocks_to_peer(&mut self) -> Result<(), Error> {
        let mut message = BitswapMessage::new(false);
        let mut sent_blocks = Vec::new();
        let mut sent_dont_haves = Vec::new();

        for entry in self.entries() {
            let key = BlockKey::from(&entry.cid);
            match self.store.get(&entry.cid).await? {
                Some(data) => {
                    if entry.want_type == WantType::Block
                        || data.len() < self.max_size_replace_has_with_block
                    {
                        message.add_block(Block::new(data, entry.cid));
                        sent_blocks.push(key);
                    } else {
                        message.add_have(entry.cid);
                    }
                }
                None => {
                    if entry.send_dont_have && !entry.sent_dont_have {
                        message.add_dont_have(entry.cid);
                        sent_dont_haves.push(key);
                    }
                }
            }
        }

        if message.blocks_len() == 0 && message.block_presences_len() == 0 {
            return Ok(());
        }

        self.network.send_message(self.partner, &message).await?;

        let block_bytes = message.block_bytes();
        trace!(
            "sent {} blocks ({} bytes) and {} presences to {}",
            message.blocks_len(),
            block_bytes,
            message.block_presences_len(),
            self.partner
        );
        self.sent_bytes(block_bytes);

        let metrics = self.network.metrics();
        metrics.blocks_sent.inc_by(message.blocks_len() as u64);
        metrics.bytes_sent.inc_by(block_bytes as u64);
        metrics.haves_sent.inc_by(message.haves().count() as u64);
        metrics.dont_haves_sent.inc_by(message.dont_haves().count() as u64);

        for key in sent_blocks {
            self.wants.remove(&key);
        }
        for key in sent_dont_haves {
            if let Some(entry) = self.wants.get_mut(&key) {
                entry.sent_dont_have = true;
            }
        }

        Ok(())
    }
}
