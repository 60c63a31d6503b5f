use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::AHashSet;
use bytes::Bytes;
use cid::Cid;
use futures::future;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace};

use super::wantlist::WantList;
use crate::error::Error;
use crate::network::{Network, Transport};

const DEFAULT_MIN_PROVIDERS: usize = 1;
const DEFAULT_MAX_PROVIDERS: usize = 5;
const DEFAULT_QUERY_CONCURRENCY: usize = 5;
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Peers that must confirm the root before the session is ready.
    pub min_providers: usize,
    /// Discovery stops once this many peers have joined.
    pub max_providers: usize,
    /// Candidates probed at the same time.
    pub query_concurrency: usize,
    /// How long a single candidate has to answer.
    pub query_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            min_providers: DEFAULT_MIN_PROVIDERS,
            max_providers: DEFAULT_MAX_PROVIDERS,
            query_concurrency: DEFAULT_QUERY_CONCURRENCY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

/// A set of peers believed to hold the DAG under `root`.
///
/// Peers join after answering HAVE for the root. Discovery runs in the background until
/// `max_providers` is reached, the candidates run out or the session is closed. Dropping the
/// last handle closes the session.
#[derive(Debug)]
pub struct Session<T> {
    inner: Arc<Inner<T>>,
    _close_on_drop: Arc<DropGuard>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Session {
            inner: self.inner.clone(),
            _close_on_drop: self._close_on_drop.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    root: Cid,
    want_list: WantList<T>,
    network: Network<T>,
    config: SessionConfig,
    peers: Mutex<AHashSet<PeerId>>,
    closer: CancellationToken,
}

type Ready = oneshot::Sender<Result<(), Error>>;

enum Step {
    Closed,
    Abandoned,
    Found(Option<PeerId>),
}

impl<T: Transport> Session<T> {
    /// Starts discovery over the already connected peers and the providers of `root`.
    ///
    /// The returned receiver resolves once `min_providers` peers joined, or with the reason
    /// they never did. Dropping it before that stops discovery.
    pub(crate) fn new(
        root: Cid,
        connected: Vec<PeerId>,
        want_list: WantList<T>,
        network: Network<T>,
        config: SessionConfig,
        closer: CancellationToken,
    ) -> (Self, oneshot::Receiver<Result<(), Error>>) {
        let inner = Arc::new(Inner {
            root,
            want_list,
            network,
            config,
            peers: Default::default(),
            closer: closer.clone(),
        });
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(inner.clone().run_discovery(connected, ready_tx));

        let session = Session {
            inner,
            _close_on_drop: Arc::new(closer.drop_guard()),
        };
        (session, ready_rx)
    }

    pub fn root(&self) -> &Cid {
        &self.inner.root
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.peers.lock().unwrap().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops discovery. Peers found so far stay usable.
    pub fn close(&self) {
        self.inner.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_cancelled()
    }

    /// Fetches a block from whichever session peer delivers first.
    ///
    /// When every peer fails and `cancel` has not fired, new providers for `cid` are looked up
    /// and raced as well, until the session is full.
    pub async fn want(&self, cid: Cid, cancel: &CancellationToken) -> Result<Bytes, Error> {
        let peers = self.peers();
        if peers.is_empty() {
            return Err(Error::NoSessionPeers);
        }

        // cancels the losing requests and this want's discovery once we return
        let want_token = cancel.child_token();
        let _done = want_token.clone().drop_guard();
        let want_list = &self.inner.want_list;
        let fetch = |peer: PeerId| {
            let token = want_token.clone();
            async move { want_list.want_block_from(cid, peer, &token).await }
        };

        let mut errors = Vec::new();
        let mut race: FuturesUnordered<_> = peers.into_iter().map(&fetch).collect();
        while let Some(res) = race.next().await {
            match res {
                Ok(data) => return Ok(data),
                Err(err) => errors.push(err),
            }
        }

        if !cancel.is_cancelled() && self.len() < self.inner.config.max_providers {
            debug!("session {}: widening search for {}", self.inner.root, cid);
            let search = self.inner.closer.child_token();
            let _search_done = search.clone().drop_guard();
            let mut new_peers = self.inner.probe_candidates(
                cid,
                self.inner.network.find_providers(cid),
                want_token.clone(),
            );
            let mut searching = true;

            while searching || !race.is_empty() {
                tokio::select! {
                    biased;
                    _ = want_token.cancelled() => break,
                    _ = search.cancelled(), if searching => searching = false,
                    peer = new_peers.next(), if searching => match peer {
                        Some(peer) => {
                            if self.inner.add_peer(peer) {
                                race.push(fetch(peer));
                            }
                        }
                        None => searching = false,
                    },
                    Some(res) = race.next(), if !race.is_empty() => match res {
                        Ok(data) => return Ok(data),
                        Err(err) => errors.push(err),
                    },
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        Err(Error::AllPeersFailed(errors))
    }
}

impl<T: Transport> Inner<T> {
    fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    async fn run_discovery(self: Arc<Self>, connected: Vec<PeerId>, ready: Ready) {
        let root = self.root;
        let config = &self.config;
        let closer = self.closer.clone();
        let mut ready = Some(ready);
        if config.min_providers == 0 {
            resolve(&mut ready, Ok(()));
        }

        let candidates = stream::select(
            stream::iter(connected),
            self.network.find_providers(root),
        )
        .boxed();
        let mut found = self.probe_candidates(root, candidates, closer.clone());

        loop {
            let step = tokio::select! {
                biased;
                _ = closer.cancelled() => Step::Closed,
                _ = abandoned(&mut ready) => Step::Abandoned,
                peer = found.next() => Step::Found(peer),
            };

            let peer = match step {
                Step::Closed => {
                    debug!("session {}: closed during discovery", root);
                    resolve(&mut ready, Err(Error::Aborted));
                    break;
                }
                Step::Abandoned => {
                    debug!("session {}: nobody waits for readiness, stopping discovery", root);
                    break;
                }
                Step::Found(Some(peer)) => peer,
                Step::Found(None) => {
                    let count = self.len();
                    debug!("session {}: candidates exhausted with {} peers", root, count);
                    if count < config.min_providers {
                        let err = Error::InsufficientProviders {
                            found: count,
                            required: config.min_providers,
                        };
                        resolve(&mut ready, Err(err));
                    }
                    break;
                }
            };

            if !self.add_peer(peer) {
                break;
            }
            let count = self.len();
            if count >= config.min_providers {
                resolve(&mut ready, Ok(()));
            }
            if count >= config.max_providers {
                debug!("session {}: reached {} peers, stopping discovery", root, count);
                break;
            }
        }
    }

    /// Adds a peer unless the session is full. Returns `false` if it was full.
    fn add_peer(&self, peer: PeerId) -> bool {
        let peers = &mut *self.peers.lock().unwrap();
        if peers.len() >= self.config.max_providers {
            return false;
        }
        if peers.insert(peer) {
            trace!("session {}: added peer {}", self.root, peer);
            self.network.metrics().providers_added.inc();
        }
        true
    }

    /// Probes each candidate for `cid`, at most `query_concurrency` at a time, yielding the
    /// peers that have it.
    fn probe_candidates(
        self: &Arc<Self>,
        cid: Cid,
        candidates: BoxStream<'static, PeerId>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, PeerId> {
        let mut seen = AHashSet::new();
        let inner = self.clone();
        candidates
            .filter(move |peer| future::ready(seen.insert(*peer)))
            .map(move |peer| probe(inner.clone(), cid, peer, cancel.clone()))
            .buffer_unordered(self.config.query_concurrency.max(1))
            .filter_map(future::ready)
            .boxed()
    }
}

fn resolve(ready: &mut Option<Ready>, res: Result<(), Error>) {
    if let Some(tx) = ready.take() {
        tx.send(res).ok();
    }
}

/// Completes once the readiness receiver is dropped before readiness was reported.
async fn abandoned(ready: &mut Option<Ready>) {
    match ready {
        Some(tx) => tx.closed().await,
        None => future::pending().await,
    }
}

/// Asks `peer` whether it has `cid`, returning the peer if it does.
async fn probe<T: Transport>(
    inner: Arc<Inner<T>>,
    cid: Cid,
    peer: PeerId,
    cancel: CancellationToken,
) -> Option<PeerId> {
    if inner.peers.lock().unwrap().contains(&peer) {
        return None;
    }
    inner.network.metrics().providers_probed.inc();

    if let Err(err) = inner.network.dial(peer).await {
        debug!("probe {}: failed to dial {}: {:?}", cid, peer, err);
        return None;
    }

    let presence = inner.want_list.want_presence(cid, peer, &cancel);
    let presence = tokio::time::timeout(inner.config.query_timeout, presence)
        .await
        .unwrap_or(Err(Error::Timeout));
    match presence {
        Ok(true) => Some(peer),
        Ok(false) => {
            trace!("probe {}: {} does not have it", cid, peer);
            None
        }
        Err(err) => {
            debug!("probe {}: {} failed: {}", cid, peer, err);
            None
        }
    }
}
