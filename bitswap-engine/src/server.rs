use std::sync::{Arc, Mutex};

use ahash::AHashMap;
use cid::Cid;
use futures::future::join_all;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::block::BlockKey;
use crate::message::BitswapMessage;
use crate::network::{Network, Transport};
use crate::Store;

use self::ledger::{Ledger, PeerWantListEntry, Receipt};

pub mod ledger;

/// Blocks smaller than this are sent right away in answer to a want-have.
const MAX_SIZE_REPLACE_HAS_WITH_BLOCK: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The maximum size of a block, in bytes, that is sent in place of a HAVE.
    pub max_size_replace_has_with_block: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_size_replace_has_with_block: MAX_SIZE_REPLACE_HAS_WITH_BLOCK,
        }
    }
}

type SharedLedger<S, T> = Arc<tokio::sync::Mutex<Ledger<S, T>>>;

/// The serving half of bitswap: one ledger per peer that sent us a want list.
#[derive(Debug)]
pub struct Server<S, T> {
    inner: Arc<Inner<S, T>>,
}

impl<S, T> Clone for Server<S, T> {
    fn clone(&self) -> Self {
        Server {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<S, T> {
    store: S,
    network: Network<T>,
    config: ServerConfig,
    ledgers: Mutex<AHashMap<PeerId, SharedLedger<S, T>>>,
}

impl<S: Store, T: Transport> Server<S, T> {
    pub fn new(network: Network<T>, store: S, config: ServerConfig) -> Self {
        Server {
            inner: Arc::new(Inner {
                store,
                network,
                config,
                ledgers: Default::default(),
            }),
        }
    }

    fn find_or_create(&self, peer: &PeerId) -> SharedLedger<S, T> {
        self.inner
            .ledgers
            .lock()
            .unwrap()
            .entry(*peer)
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(Ledger::new(
                    *peer,
                    self.inner.store.clone(),
                    self.inner.network.clone(),
                    self.inner.config.max_size_replace_has_with_block,
                )))
            })
            .clone()
    }

    fn get(&self, peer: &PeerId) -> Option<SharedLedger<S, T>> {
        self.inner.ledgers.lock().unwrap().get(peer).cloned()
    }

    /// Applies a want list from `peer` and answers whatever we can.
    pub async fn received_message(&self, peer: &PeerId, message: &BitswapMessage) {
        let ledger = self.find_or_create(peer);
        let ledger = &mut *ledger.lock().await;

        if message.full() {
            ledger.clear_wants();
        }
        for entry in message.wantlist() {
            if entry.cancel {
                ledger.cancel_want(&entry.cid);
            } else {
                ledger.wants(PeerWantListEntry::from(entry));
            }
        }
        ledger.received_bytes(message.block_bytes());

        if let Err(err) = ledger.send_blocks_to_peer().await {
            warn!("failed to answer want list from {}: {}", peer, err);
        }
    }

    /// A block became available locally, flush the ledgers that want it.
    pub async fn received_block(&self, cid: &Cid) {
        let key = BlockKey::from(cid);
        let ledgers: Vec<_> = self.inner.ledgers.lock().unwrap().values().cloned().collect();

        join_all(ledgers.into_iter().map(|ledger| async move {
            let ledger = &mut *ledger.lock().await;
            if !ledger.wants_block(&key) {
                return;
            }
            debug!("flushing {} to {}", cid, ledger.partner());
            if let Err(err) = ledger.send_blocks_to_peer().await {
                warn!("failed to send {} to {}: {}", cid, ledger.partner(), err);
            }
        }))
        .await;
    }

    /// Discards the ledger of a peer.
    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.inner.ledgers.lock().unwrap().remove(peer);
    }

    pub async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<PeerWantListEntry> {
        match self.get(peer) {
            Some(ledger) => ledger.lock().await.entries(),
            None => Vec::new(),
        }
    }

    pub async fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        let ledger = self.get(peer)?;
        let receipt = ledger.lock().await.receipt();
        Some(receipt)
    }

    /// Peers we hold a ledger for.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.ledgers.lock().unwrap().keys().copied().collect()
    }
}
