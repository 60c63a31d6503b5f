//! Want-list, ledger and session engine of the [bitswap protocol](https://github.com/ipfs/specs/blob/master/BITSWAP.md).
//!
//! Supports the versions `1.0.0`, `1.1.0` and `1.2.0` of the wire format. Connections, streams
//! and content routing are provided by a [`Transport`], blocks are read through a [`Store`].

use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use self::client::session::{Session, SessionConfig};
use self::client::wantlist::WantListEntry;
use self::client::{Client, ClientConfig};
use self::network::{Network, NetworkConfig};
use self::server::ledger::{PeerWantListEntry, Receipt};
use self::server::{Server, ServerConfig};

pub mod block;
pub mod client;
pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
pub mod prefix;
pub mod server;
pub mod store;

pub use self::block::{Block, BlockKey};
pub use self::error::Error;
pub use self::message::{BitswapMessage, Priority, WantType};
pub use self::metrics::Metrics;
pub use self::network::Transport;
pub use self::store::MemoryStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub network: NetworkConfig,
}

/// Read access to the local blocks.
#[async_trait]
pub trait Store: Debug + Clone + Send + Sync + 'static {
    /// Returns `Ok(None)` if the block is not stored locally.
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;
}

#[derive(Debug)]
pub struct Bitswap<S, T> {
    network: Network<T>,
    client: Client<T>,
    server: Server<S, T>,
}

impl<S, T> Clone for Bitswap<S, T> {
    fn clone(&self) -> Self {
        Bitswap {
            network: self.network.clone(),
            client: self.client.clone(),
            server: self.server.clone(),
        }
    }
}

impl<S: Store, T: Transport> Bitswap<S, T> {
    pub fn new(self_id: PeerId, store: S, transport: T, config: Config) -> Self {
        Self::with_metrics(self_id, store, transport, config, Metrics::default())
    }

    /// Like [`Bitswap::new`], recording into the given metrics.
    pub fn with_metrics(
        self_id: PeerId,
        store: S,
        transport: T,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        let network = Network::new(self_id, transport, config.network, metrics);
        let client = Client::new(network.clone(), config.client);
        let server = Server::new(network.clone(), store, config.server);

        Bitswap {
            network,
            client,
            server,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        self.network.self_id()
    }

    pub fn client(&self) -> &Client<T> {
        &self.client
    }

    pub fn server(&self) -> &Server<S, T> {
        &self.server
    }

    pub fn metrics(&self) -> &Metrics {
        self.network.metrics()
    }

    /// Fetches a block from the network.
    ///
    /// Searches for up to `max_providers` providers while the want is broadcast to every
    /// connected peer. The search is stopped once the block arrives or `cancel` fires.
    pub async fn want(
        &self,
        cid: Cid,
        max_providers: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, Error> {
        trace!("want {}", cid);
        self.client.want(cid, max_providers, cancel).await
    }

    /// Announces a block that was just added to the store.
    ///
    /// Resolves local wants for it and serves the peers that asked for it.
    pub async fn notify(&self, cid: &Cid, data: &Bytes) {
        futures::future::join(
            self.client.received_block(cid, data),
            self.server.received_block(cid),
        )
        .await;
    }

    /// Creates a session for the DAG under `root`, resolving once enough providers joined.
    ///
    /// Falls back to the configured session settings when `config` is `None`.
    pub async fn create_session(
        &self,
        root: Cid,
        config: Option<SessionConfig>,
    ) -> Result<Session<T>, Error> {
        self.client.create_session(root, config).await
    }

    /// Our live wants, highest priority first.
    pub fn wantlist(&self) -> Vec<WantListEntry> {
        self.client.wantlist()
    }

    /// What the peer currently wants from us.
    pub async fn peer_wantlist(&self, peer: &PeerId) -> Vec<PeerWantListEntry> {
        self.server.wantlist_for_peer(peer).await
    }

    pub async fn ledger_for_peer(&self, peer: &PeerId) -> Option<Receipt> {
        self.server.ledger_for_peer(peer).await
    }

    /// Connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.client.want_list().peers()
    }

    pub fn stat(&self) -> Stat {
        let metrics = self.network.metrics();
        Stat {
            wantlist: self.wantlist().into_iter().map(|e| e.cid).collect(),
            peers: self.peers(),
            blocks_received: metrics.blocks_received.get(),
            data_received: metrics.bytes_received.get(),
            dup_blks_received: metrics.dup_blocks_received.get(),
            dup_data_received: metrics.dup_bytes_received.get(),
            messages_received: metrics.messages_received.get(),
            blocks_sent: metrics.blocks_sent.get(),
            data_sent: metrics.bytes_sent.get(),
        }
    }

    pub async fn peer_connected(&self, peer: PeerId) {
        debug!("peer connected: {}", peer);
        self.client.peer_connected(peer).await;
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        debug!("peer disconnected: {}", peer);
        self.client.peer_disconnected(peer);
        self.server.peer_disconnected(peer);
    }

    /// Handles a message from a peer: resolves our wants and answers theirs.
    pub async fn receive_message(&self, peer: PeerId, message: BitswapMessage) {
        trace!(
            "received message from {}: {} wants, {} blocks, {} presences",
            peer,
            message.wantlist_len(),
            message.blocks_len(),
            message.block_presences_len()
        );
        self.network.metrics().messages_received.inc();
        self.client.received_message(&peer, &message).await;
        self.server.received_message(&peer, &message).await;
    }

    /// Decodes a frame read from a peer's stream and handles it.
    pub async fn receive_frame(&self, peer: PeerId, frame: Bytes) -> Result<(), Error> {
        let message = self.network.decode(frame)?;
        self.receive_message(peer, message).await;
        Ok(())
    }

    /// Stops all sessions and provider searches.
    pub fn stop(&self) {
        self.client.stop();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
}
