use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;
use crate::message::{BitswapMessage, Priority};
use crate::network::{Network, Transport};

use self::session::{Session, SessionConfig};
use self::wantlist::{WantList, WantListEntry, WantOptions};

pub mod session;
pub mod wantlist;

const DEFAULT_PRIORITY: Priority = 1;
const DEFAULT_MAX_PROVIDERS_PER_REQUEST: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Priority of wants that do not carry their own.
    pub default_priority: Priority,
    /// Providers connected to by a single [`Client::want`] search.
    pub max_providers_per_request: usize,
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            default_priority: DEFAULT_PRIORITY,
            max_providers_per_request: DEFAULT_MAX_PROVIDERS_PER_REQUEST,
            session: SessionConfig::default(),
        }
    }
}

/// The fetching half of bitswap.
#[derive(Debug)]
pub struct Client<T> {
    network: Network<T>,
    want_list: WantList<T>,
    config: ClientConfig,
    /// Parent of every session and provider search.
    closer: CancellationToken,
}

impl<T> Clone for Client<T> {
    fn clone(&self) -> Self {
        Client {
            network: self.network.clone(),
            want_list: self.want_list.clone(),
            config: self.config.clone(),
            closer: self.closer.clone(),
        }
    }
}

impl<T: Transport> Client<T> {
    pub fn new(network: Network<T>, config: ClientConfig) -> Self {
        let want_list = WantList::new(network.clone(), config.default_priority);
        Client {
            network,
            want_list,
            config,
            closer: CancellationToken::new(),
        }
    }

    pub fn want_list(&self) -> &WantList<T> {
        &self.want_list
    }

    /// Fetches a block from any connected peer, searching for providers of it meanwhile.
    ///
    /// The provider search is stopped as soon as this returns.
    pub async fn want(
        &self,
        cid: Cid,
        max_providers: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<Bytes, Error> {
        if self.closer.is_cancelled() {
            return Err(Error::Aborted);
        }
        let max_providers = max_providers.unwrap_or(self.config.max_providers_per_request);
        let search = self.closer.child_token();
        let _search_done = search.clone().drop_guard();
        tokio::spawn(self.clone().find_and_connect(cid, max_providers, search));

        self.want_list
            .want_block(cid, WantOptions::default(), cancel)
            .await
    }

    /// Looks up providers of `cid` and connects to up to `max_providers` of them.
    ///
    /// Dials run with bounded concurrency and stop once `cancel` fires. Returns the number of
    /// providers connected.
    pub async fn find_and_connect(
        self,
        cid: Cid,
        max_providers: usize,
        cancel: CancellationToken,
    ) -> usize {
        let network = self.network.clone();
        let mut dials = self
            .network
            .find_providers(cid)
            .map(move |peer| {
                let network = network.clone();
                async move { (peer, network.dial(peer).await) }
            })
            .buffer_unordered(self.network.config().dial_concurrency.max(1));

        let mut connected = 0;
        while connected < max_providers {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = dials.next() => next,
            };
            match next {
                Some((peer, Ok(()))) => {
                    trace!("connected to provider {} for {}", peer, cid);
                    connected += 1;
                }
                Some((peer, Err(err))) => {
                    debug!("failed to dial provider {} for {}: {:?}", peer, cid, err);
                }
                None => break,
            }
        }
        debug!("provider search for {} connected {} peers", cid, connected);
        connected
    }

    /// Creates a session for the DAG under `root` and waits until it is ready.
    pub async fn create_session(
        &self,
        root: Cid,
        config: Option<SessionConfig>,
    ) -> Result<Session<T>, Error> {
        let config = config.unwrap_or_else(|| self.config.session.clone());
        self.network.metrics().sessions_created.inc();
        let (session, ready) = Session::new(
            root,
            self.want_list.peers(),
            self.want_list.clone(),
            self.network.clone(),
            config,
            self.closer.child_token(),
        );
        ready.await.map_err(|_| Error::Aborted)??;
        Ok(session)
    }

    pub async fn received_block(&self, cid: &Cid, data: &Bytes) {
        self.want_list.received_block(cid, data).await;
    }

    pub async fn received_message(&self, peer: &PeerId, message: &BitswapMessage) {
        self.want_list.received_message(peer, message).await;
    }

    pub async fn peer_connected(&self, peer: PeerId) {
        self.want_list.connected(peer).await;
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        self.want_list.disconnected(peer);
    }

    pub fn wantlist(&self) -> Vec<WantListEntry> {
        self.want_list.entries()
    }

    /// Stops every session's discovery and all provider searches.
    pub fn stop(&self) {
        self.closer.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::session::tests::{Remote, Swarm};
    use super::*;
    use crate::block::create_block_v1;

    fn client(swarm: &Swarm) -> Client<session::tests::ChannelTransport> {
        Client {
            network: swarm.network.clone(),
            want_list: swarm.want_list.clone(),
            config: ClientConfig::default(),
            closer: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_want_from_connected_peer() {
        let block = create_block_v1(vec![1u8; 64]);
        let swarm = Swarm::new(vec![Remote::new(&[]), Remote::new(&[&block])]).await;
        let client = client(&swarm);

        let data = client
            .want(block.cid, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(data, block.data);

        // the want is gone once the block arrived
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.wantlist().is_empty());
    }

    #[tokio::test]
    async fn test_find_and_connect_respects_max() {
        let block = create_block_v1(vec![2u8; 64]);
        let remotes: Vec<_> = (0..5).map(|_| Remote::new(&[&block])).collect();
        let swarm = Swarm::new(remotes).await;
        let client = client(&swarm);

        let connected = client
            .clone()
            .find_and_connect(block.cid, 2, CancellationToken::new())
            .await;
        assert_eq!(connected, 2);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let connected = client.find_and_connect(block.cid, 2, cancel).await;
        assert_eq!(connected, 0);
    }

    #[tokio::test]
    async fn test_create_session_uses_config() {
        let root = create_block_v1(vec![3u8; 64]);
        let swarm = Swarm::new(vec![Remote::new(&[&root])]).await;
        let client = client(&swarm);

        let session = client.create_session(root.cid, None).await.unwrap();
        assert_eq!(session.len(), 1);
        assert_eq!(swarm.network.metrics().sessions_created.get(), 1);

        let config = SessionConfig {
            min_providers: 2,
            ..Default::default()
        };
        let err = client.create_session(root.cid, Some(config)).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientProviders { found: 1, required: 2 }));
    }

    #[tokio::test]
    async fn test_stop_closes_sessions() {
        let root = create_block_v1(vec![4u8; 64]);
        let swarm = Swarm::new(vec![Remote::new(&[&root])]).await;
        let client = client(&swarm);

        let session = client.create_session(root.cid, None).await.unwrap();
        assert!(!session.is_closed());
        client.stop();
        assert!(session.is_closed());

        let err = client
            .want(root.cid, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }
}
