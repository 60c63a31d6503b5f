use std::sync::{Arc, Mutex};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use cid::Cid;
use futures::future::join_all;
use libp2p_identity::PeerId;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::block::BlockKey;
use crate::error::Error;
use crate::message::{BitswapMessage, BlockPresenceType, Priority, WantType};
use crate::network::{Network, Transport};

/// A block the local node wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantListEntry {
    pub cid: Cid,
    /// Peers the want is scoped to, empty means every connected peer.
    pub session: AHashSet<PeerId>,
    pub priority: Priority,
    pub want_type: WantType,
    pub cancel: bool,
    pub send_dont_have: bool,
    /// Set by explicit [`WantList::want_blocks`] calls, keeps the entry alive without waiters.
    pinned: bool,
}

impl WantListEntry {
    fn in_scope(&self, peer: &PeerId) -> bool {
        self.session.is_empty() || self.session.contains(peer)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WantOptions {
    /// Restricts the want to these peers. Empty means broadcast.
    pub session: Vec<PeerId>,
    /// Falls back to the configured default priority.
    pub priority: Option<Priority>,
    /// Defaults to [`WantType::Block`].
    pub want_type: Option<WantType>,
    pub send_dont_have: bool,
}

/// What a peer was told about a want.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SentWant {
    want_type: WantType,
    priority: Priority,
    send_dont_have: bool,
}

impl From<&WantListEntry> for SentWant {
    fn from(entry: &WantListEntry) -> Self {
        SentWant {
            want_type: entry.want_type,
            priority: entry.priority,
            send_dont_have: entry.send_dont_have,
        }
    }
}

#[derive(Debug)]
enum Reply {
    Block(oneshot::Sender<Result<Bytes, Error>>),
    Presence(oneshot::Sender<Result<bool, Error>>),
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    /// Only answers from this peer count, and its disconnect fails the waiter.
    peer: Option<PeerId>,
    reply: Reply,
}

impl Waiter {
    fn wants_block(&self) -> bool {
        matches!(self.reply, Reply::Block(_))
    }

    fn fail(self, err: Error) {
        match self.reply {
            Reply::Block(tx) => tx.send(Err(err)).ok(),
            Reply::Presence(tx) => tx.send(Err(err)).ok(),
        };
    }
}

#[derive(Debug, Default)]
struct State {
    wants: AHashMap<BlockKey, WantListEntry>,
    /// What each connected peer has been sent.
    peers: AHashMap<PeerId, AHashMap<BlockKey, SentWant>>,
    waiters: AHashMap<BlockKey, Vec<Waiter>>,
    next_waiter: u64,
}

impl State {
    /// Inserts or updates an entry. Returns `true` if peers need to hear about it.
    fn upsert(&mut self, cid: Cid, options: &WantOptions, priority: Priority, pin: bool) -> bool {
        let key = BlockKey::from(&cid);
        let want_type = options.want_type.unwrap_or(WantType::Block);

        match self.wants.get_mut(&key) {
            Some(entry) => {
                let mut changed = false;
                if entry.cancel {
                    entry.cancel = false;
                    entry.session.clear();
                    entry.session.extend(options.session.iter().copied());
                    entry.want_type = want_type;
                    entry.priority = priority;
                    entry.send_dont_have = options.send_dont_have;
                    entry.pinned = pin;
                    return true;
                }

                // a want-have never downgrades a want-block
                if entry.want_type == WantType::Have && want_type == WantType::Block {
                    entry.want_type = WantType::Block;
                    changed = true;
                }
                if entry.want_type == want_type && entry.priority != priority {
                    entry.priority = priority;
                    changed = true;
                }

                if options.session.is_empty() {
                    if !entry.session.is_empty() {
                        entry.session.clear();
                        changed = true;
                    }
                } else if !entry.session.is_empty() {
                    for peer in &options.session {
                        changed |= entry.session.insert(*peer);
                    }
                }

                if options.send_dont_have && !entry.send_dont_have {
                    entry.send_dont_have = true;
                    changed = true;
                }
                entry.pinned |= pin;
                changed
            }
            None => {
                self.wants.insert(
                    key,
                    WantListEntry {
                        cid,
                        session: options.session.iter().copied().collect(),
                        priority,
                        want_type,
                        cancel: false,
                        send_dont_have: options.send_dont_have,
                        pinned: pin,
                    },
                );
                true
            }
        }
    }

    /// Marks the entry as cancelled. Returns `true` if it was live.
    fn cancel(&mut self, key: &BlockKey) -> bool {
        match self.wants.get_mut(key) {
            Some(entry) if !entry.cancel => {
                entry.cancel = true;
                entry.pinned = false;
                true
            }
            _ => false,
        }
    }

    fn fail_waiters(&mut self, key: &BlockKey, err: impl Fn() -> Error) {
        if let Some(waiters) = self.waiters.remove(key) {
            for waiter in waiters {
                waiter.fail(err());
            }
        }
    }

    /// Removes and returns the waiters on `key` matching `pred`.
    fn take_waiters(&mut self, key: &BlockKey, pred: impl Fn(&Waiter) -> bool) -> Vec<Waiter> {
        let Some(waiters) = self.waiters.get_mut(key) else {
            return Vec::new();
        };
        let (taken, rest): (Vec<_>, Vec<_>) = std::mem::take(waiters).into_iter().partition(pred);
        if rest.is_empty() {
            self.waiters.remove(key);
        } else {
            *waiters = rest;
        }
        taken
    }

    /// Resolves waiters for a block that arrived, either from `from` or from local storage.
    ///
    /// Returns `true` if the block was wanted.
    fn resolve_block(&mut self, cid: &Cid, data: &Bytes, from: Option<PeerId>) -> bool {
        let key = BlockKey::from(cid);
        let wanted = self.wants.get(&key).map(|e| !e.cancel).unwrap_or_default();

        let resolved = self.take_waiters(&key, |w| {
            w.wants_block() || (from.is_some() && w.peer == from)
        });
        for waiter in resolved {
            match waiter.reply {
                Reply::Block(tx) => tx.send(Ok(data.clone())).ok(),
                Reply::Presence(tx) => tx.send(Ok(true)).ok(),
            };
        }

        if !self.waiters.contains_key(&key) {
            self.cancel(&key);
        }
        wanted
    }

    /// Drops cancelled entries that no peer still needs to be told about.
    fn purge(&mut self) {
        let peers = &self.peers;
        self.wants.retain(|key, entry| {
            !entry.cancel || peers.values().any(|sent| sent.contains_key(key))
        });
    }

    fn sorted_entries(&self) -> Vec<(BlockKey, &WantListEntry)> {
        let mut entries: Vec<_> = self.wants.iter().map(|(k, e)| (*k, e)).collect();
        entries.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority));
        entries
    }
}

/// A message for one peer plus the sent-set changes to apply once it is delivered.
#[derive(Debug)]
struct Batch {
    peer: PeerId,
    message: BitswapMessage,
    /// `Some(want)` records a want, `None` removes a cancelled one.
    updates: Vec<(BlockKey, Option<SentWant>)>,
    full: bool,
}

/// The local want list.
///
/// Keeps the wanted blocks, diffs them against what each connected peer has already been sent
/// and hands out waiters that resolve when blocks or presences arrive.
#[derive(Debug)]
pub struct WantList<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WantList<T> {
    fn clone(&self) -> Self {
        WantList {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    network: Network<T>,
    default_priority: Priority,
    state: Mutex<State>,
    /// Serializes send passes.
    send_lock: tokio::sync::Mutex<()>,
}

impl<T: Transport> WantList<T> {
    pub fn new(network: Network<T>, default_priority: Priority) -> Self {
        WantList {
            inner: Arc::new(Inner {
                network,
                default_priority,
                state: Default::default(),
                send_lock: Default::default(),
            }),
        }
    }

    /// Adds or upgrades wants for the given blocks and tells the peers about them.
    pub async fn want_blocks(&self, cids: &[Cid], options: WantOptions) {
        let priority = options.priority.unwrap_or(self.inner.default_priority);
        let changed = {
            let state = &mut *self.inner.state.lock().unwrap();
            let mut changed = false;
            for cid in cids {
                changed |= state.upsert(*cid, &options, priority, true);
            }
            changed
        };
        if changed {
            self.send_wants().await;
        }
    }

    /// Cancels wants and tells the peers that were sent them.
    ///
    /// Anyone still waiting on these blocks gets [`Error::Aborted`].
    pub async fn cancel_wants(&self, cids: &[Cid]) {
        let changed = {
            let state = &mut *self.inner.state.lock().unwrap();
            let mut changed = false;
            for cid in cids {
                let key = BlockKey::from(cid);
                if state.cancel(&key) {
                    state.fail_waiters(&key, || Error::Aborted);
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.send_wants().await;
        }
    }

    /// Forgets wants locally, without telling any peer.
    pub fn unwant_blocks(&self, cids: &[Cid]) {
        let state = &mut *self.inner.state.lock().unwrap();
        for cid in cids {
            let key = BlockKey::from(cid);
            if state.wants.remove(&key).is_some() {
                state.fail_waiters(&key, || Error::Aborted);
                for sent in state.peers.values_mut() {
                    sent.remove(&key);
                }
            }
        }
    }

    /// Sends the full want list to a newly connected peer.
    pub async fn connected(&self, peer: PeerId) {
        let _guard = self.inner.send_lock.lock().await;
        let batch = {
            let state = &mut *self.inner.state.lock().unwrap();
            state.peers.insert(peer, Default::default());

            let mut message = BitswapMessage::new(true);
            let mut updates = Vec::new();
            for (key, entry) in state.sorted_entries() {
                if entry.cancel || !entry.in_scope(&peer) {
                    continue;
                }
                message.add_entry(entry.cid, entry.priority, entry.want_type, entry.send_dont_have);
                updates.push((key, Some(SentWant::from(entry))));
            }
            Batch {
                peer,
                message,
                updates,
                full: true,
            }
        };

        if batch.updates.is_empty() {
            return;
        }
        debug!("sending full want list ({}) to {}", batch.updates.len(), peer);
        self.deliver(vec![batch]).await;
    }

    /// Drops everything known about what the peer was sent.
    pub fn disconnected(&self, peer: &PeerId) {
        let state = &mut *self.inner.state.lock().unwrap();
        state.peers.remove(peer);
        let keys: Vec<_> = state.waiters.keys().copied().collect();
        for key in keys {
            for waiter in state.take_waiters(&key, |w| w.peer.as_ref() == Some(peer)) {
                waiter.fail(Error::PeerDisconnected { peer: *peer });
            }
        }
        state.purge();
    }

    /// Runs one send pass: every connected peer gets the wants it has not seen yet and
    /// cancels for the wants it has seen.
    pub async fn send_wants(&self) {
        let _guard = self.inner.send_lock.lock().await;
        let batches = {
            let state = &*self.inner.state.lock().unwrap();
            let entries = state.sorted_entries();
            let mut batches = Vec::new();

            for (peer, sent) in &state.peers {
                let mut message = BitswapMessage::new(false);
                let mut updates = Vec::new();
                for (key, entry) in &entries {
                    // a want that left the peer's scope is cancelled there as well
                    if entry.cancel || !entry.in_scope(peer) {
                        if sent.contains_key(key) {
                            message.cancel(entry.cid);
                            updates.push((*key, None));
                        }
                    } else if sent.get(key) != Some(&SentWant::from(*entry)) {
                        message.add_entry(
                            entry.cid,
                            entry.priority,
                            entry.want_type,
                            entry.send_dont_have,
                        );
                        updates.push((*key, Some(SentWant::from(*entry))));
                    }
                }
                if !updates.is_empty() {
                    batches.push(Batch {
                        peer: *peer,
                        message,
                        updates,
                        full: false,
                    });
                }
            }
            batches
        };

        if !batches.is_empty() {
            self.deliver(batches).await;
        }
        self.inner.state.lock().unwrap().purge();
    }

    /// Sends the batches concurrently and records the ones that made it.
    async fn deliver(&self, batches: Vec<Batch>) {
        let network = &self.inner.network;
        let results = join_all(batches.into_iter().map(|batch| async move {
            let res = network.send_message(batch.peer, &batch.message).await;
            (batch, res)
        }))
        .await;

        let state = &mut *self.inner.state.lock().unwrap();
        let State { wants, peers, .. } = state;
        for (batch, res) in results {
            if let Err(err) = res {
                warn!("failed to send wants to {}: {}", batch.peer, err);
                continue;
            }
            let Some(sent) = peers.get_mut(&batch.peer) else {
                // disconnected while sending
                continue;
            };
            if batch.full {
                sent.clear();
            }
            let mut count_wants = 0;
            let mut count_cancels = 0;
            for (key, update) in batch.updates {
                match update {
                    Some(want) => {
                        count_wants += 1;
                        if wants.contains_key(&key) {
                            sent.insert(key, want);
                        }
                    }
                    None => {
                        count_cancels += 1;
                        sent.remove(&key);
                    }
                }
            }
            trace!(
                "sent {} wants and {} cancels to {}",
                count_wants,
                count_cancels,
                batch.peer
            );
            network.metrics().wants_sent.inc_by(count_wants);
            network.metrics().cancels_sent.inc_by(count_cancels);
        }
    }

    /// Wants a block from any peer in scope and waits for it.
    ///
    /// The want goes away once the block arrives, or is cancelled when the last waiter gives up
    /// on an entry that was not added through [`WantList::want_blocks`].
    pub async fn want_block(
        &self,
        cid: Cid,
        options: WantOptions,
        cancel: &CancellationToken,
    ) -> Result<Bytes, Error> {
        let options = WantOptions {
            want_type: Some(WantType::Block),
            ..options
        };
        self.wait_for(cid, options, None, Reply::Block, cancel).await
    }

    /// Wants a block from a single peer, failing if it answers DONT_HAVE or disconnects.
    pub async fn want_block_from(
        &self,
        cid: Cid,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<Bytes, Error> {
        let options = WantOptions {
            session: vec![peer],
            want_type: Some(WantType::Block),
            send_dont_have: true,
            ..Default::default()
        };
        self.wait_for(cid, options, Some(peer), Reply::Block, cancel).await
    }

    /// Asks a single peer whether it has the block.
    pub async fn want_presence(
        &self,
        cid: Cid,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<bool, Error> {
        let options = WantOptions {
            session: vec![peer],
            want_type: Some(WantType::Have),
            send_dont_have: true,
            ..Default::default()
        };
        self.wait_for(cid, options, Some(peer), Reply::Presence, cancel).await
    }

    /// Registers a waiter whose answer is delivered through the channel wrapped by `reply`.
    async fn wait_for<R>(
        &self,
        cid: Cid,
        options: WantOptions,
        peer: Option<PeerId>,
        reply: impl FnOnce(oneshot::Sender<Result<R, Error>>) -> Reply,
        cancel: &CancellationToken,
    ) -> Result<R, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let key = BlockKey::from(&cid);
        let priority = options.priority.unwrap_or(self.inner.default_priority);
        let (tx, rx) = oneshot::channel();
        let (id, changed) = {
            let state = &mut *self.inner.state.lock().unwrap();
            let id = state.next_waiter;
            state.next_waiter += 1;
            let changed = state.upsert(cid, &options, priority, false);
            state.waiters.entry(key).or_default().push(Waiter {
                id,
                peer,
                reply: reply(tx),
            });
            (id, changed)
        };
        let _guard = WaiterGuard {
            want_list: self.clone(),
            key,
            id,
        };

        if changed {
            self.send_wants().await;
        }

        tokio::select! {
            biased;
            res = rx => res.unwrap_or(Err(Error::Aborted)),
            _ = cancel.cancelled() => Err(Error::Aborted),
        }
    }

    /// A block became available locally.
    pub async fn received_block(&self, cid: &Cid, data: &Bytes) {
        let wanted = {
            let state = &mut *self.inner.state.lock().unwrap();
            state.resolve_block(cid, data, None)
        };
        if wanted {
            self.send_wants().await;
        }
    }

    /// Feeds blocks and presences from a peer into the pending wants.
    pub async fn received_message(&self, peer: &PeerId, message: &BitswapMessage) {
        let metrics = self.inner.network.metrics();
        let cancelled = {
            let state = &mut *self.inner.state.lock().unwrap();
            let mut cancelled = false;

            for block in message.blocks() {
                let len = block.data().len() as u64;
                metrics.blocks_received.inc();
                metrics.bytes_received.inc_by(len);
                if state.resolve_block(block.cid(), block.data(), Some(*peer)) {
                    trace!("received wanted block {} from {}", block.cid(), peer);
                    cancelled = true;
                } else {
                    metrics.dup_blocks_received.inc();
                    metrics.dup_bytes_received.inc_by(len);
                }
            }

            for presence in message.block_presences() {
                let key = BlockKey::from(&presence.cid);
                let has = presence.typ == BlockPresenceType::Have;
                let answered = state.take_waiters(&key, |w| {
                    w.peer.as_ref() == Some(peer) && (!w.wants_block() || !has)
                });
                for waiter in answered {
                    match waiter.reply {
                        Reply::Presence(tx) => tx.send(Ok(has)).ok(),
                        Reply::Block(tx) => tx.send(Err(Error::DontHave { peer: *peer })).ok(),
                    };
                }
            }

            cancelled
        };

        if cancelled {
            self.send_wants().await;
        }
    }

    /// The live (not cancelled) entries, highest priority first.
    pub fn entries(&self) -> Vec<WantListEntry> {
        let state = &*self.inner.state.lock().unwrap();
        state
            .sorted_entries()
            .into_iter()
            .filter(|(_, e)| !e.cancel)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn get(&self, cid: &Cid) -> Option<WantListEntry> {
        let state = &*self.inner.state.lock().unwrap();
        state.wants.get(&BlockKey::from(cid)).cloned()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let state = &*self.inner.state.lock().unwrap();
        state.peers.keys().copied().collect()
    }

    #[cfg(test)]
    fn is_sent(&self, peer: &PeerId, cid: &Cid) -> bool {
        let state = &*self.inner.state.lock().unwrap();
        state
            .peers
            .get(peer)
            .map(|sent| sent.contains_key(&BlockKey::from(cid)))
            .unwrap_or_default()
    }
}

/// Removes its waiter when the waiting future finishes or is dropped.
#[derive(Debug)]
struct WaiterGuard<T: Transport> {
    want_list: WantList<T>,
    key: BlockKey,
    id: u64,
}

impl<T: Transport> Drop for WaiterGuard<T> {
    fn drop(&mut self) {
        let cancelled = {
            let state = &mut *self.want_list.inner.state.lock().unwrap();
            if let Some(waiters) = state.waiters.get_mut(&self.key) {
                waiters.retain(|w| w.id != self.id);
                if waiters.is_empty() {
                    state.waiters.remove(&self.key);
                }
            }
            let unpinned = state
                .wants
                .get(&self.key)
                .map(|e| !e.pinned)
                .unwrap_or_default();
            unpinned && !state.waiters.contains_key(&self.key) && state.cancel(&self.key)
        };

        if cancelled {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let want_list = self.want_list.clone();
                handle.spawn(async move {
                    want_list.send_wants().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::block::create_block_v1;
    use crate::metrics::Metrics;
    use crate::network::tests::RecordingTransport;
    use crate::network::NetworkConfig;

    fn want_list() -> WantList<RecordingTransport> {
        let network = Network::new(
            PeerId::random(),
            RecordingTransport::default(),
            NetworkConfig::default(),
            Metrics::default(),
        );
        WantList::new(network, 1)
    }

    /// Decodes everything sent to `peer` since the last call.
    fn take_sent(wl: &WantList<RecordingTransport>, peer: &PeerId) -> Vec<BitswapMessage> {
        let network = &wl.inner.network;
        let mut frames = network.transport().frames.lock().unwrap();
        let (mine, rest): (Vec<_>, Vec<_>) = frames.drain(..).partition(|(p, _)| p == peer);
        *frames = rest;
        mine.into_iter()
            .map(|(_, frame)| network.decode(frame).unwrap())
            .collect()
    }

    fn cid(n: u8) -> Cid {
        create_block_v1(vec![n; 8]).cid
    }

    #[tokio::test]
    async fn test_want_type_never_downgrades() {
        let wl = want_list();
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        wl.want_blocks(
            &[c],
            WantOptions {
                want_type: Some(WantType::Have),
                ..Default::default()
            },
        )
        .await;
        assert_eq!(wl.get(&c).unwrap().want_type, WantType::Block);

        let c2 = cid(2);
        wl.want_blocks(
            &[c2],
            WantOptions {
                want_type: Some(WantType::Have),
                ..Default::default()
            },
        )
        .await;
        wl.want_blocks(&[c2], WantOptions::default()).await;
        assert_eq!(wl.get(&c2).unwrap().want_type, WantType::Block);
    }

    #[tokio::test]
    async fn test_unscoped_request_clears_session() {
        let wl = want_list();
        let c = cid(1);
        let peer = PeerId::random();
        wl.want_blocks(
            &[c],
            WantOptions {
                session: vec![peer],
                ..Default::default()
            },
        )
        .await;
        assert!(wl.get(&c).unwrap().session.contains(&peer));

        wl.want_blocks(&[c], WantOptions::default()).await;
        assert!(wl.get(&c).unwrap().session.is_empty());
    }

    #[tokio::test]
    async fn test_no_redundant_sends() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;

        let (a, b) = (cid(1), cid(2));
        wl.want_blocks(&[a], WantOptions::default()).await;
        let sent = take_sent(&wl, &peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].wantlist().map(|e| e.cid).collect::<Vec<_>>(), vec![a]);

        wl.want_blocks(&[a, b], WantOptions::default()).await;
        let sent = take_sent(&wl, &peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].wantlist().map(|e| e.cid).collect::<Vec<_>>(), vec![b]);

        // nothing changed, nothing to send
        wl.send_wants().await;
        assert!(take_sent(&wl, &peer).is_empty());
    }

    #[tokio::test]
    async fn test_changed_entry_is_resent() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        take_sent(&wl, &peer);

        wl.want_blocks(
            &[c],
            WantOptions {
                send_dont_have: true,
                ..Default::default()
            },
        )
        .await;
        let sent = take_sent(&wl, &peer);
        assert_eq!(sent.len(), 1);
        let entry = sent[0].wantlist().next().unwrap();
        assert_eq!(entry.cid, c);
        assert!(entry.send_dont_have);

        wl.want_blocks(
            &[c],
            WantOptions {
                priority: Some(100),
                send_dont_have: true,
                ..Default::default()
            },
        )
        .await;
        let sent = take_sent(&wl, &peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].wantlist().next().unwrap().priority, 100);

        // same again, nothing new
        wl.want_blocks(
            &[c],
            WantOptions {
                priority: Some(100),
                send_dont_have: true,
                ..Default::default()
            },
        )
        .await;
        wl.send_wants().await;
        assert!(take_sent(&wl, &peer).is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_retried() {
        let wl = want_list();
        let (down, up) = (PeerId::random(), PeerId::random());
        wl.connected(down).await;
        wl.connected(up).await;
        let transport = wl.inner.network.transport();
        transport.unreachable.lock().unwrap().insert(down);

        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        assert_eq!(take_sent(&wl, &up).len(), 1);
        assert!(take_sent(&wl, &down).is_empty());
        assert!(wl.is_sent(&up, &c));
        assert!(!wl.is_sent(&down, &c));
        assert_eq!(wl.inner.network.metrics().messages_failed.get(), 1);

        transport.unreachable.lock().unwrap().clear();
        wl.send_wants().await;
        let sent = take_sent(&wl, &down);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].wantlist().map(|e| e.cid).collect::<Vec<_>>(), vec![c]);
        assert!(wl.is_sent(&down, &c));
        assert!(take_sent(&wl, &up).is_empty());
    }

    #[tokio::test]
    async fn test_cancel_only_sent_to_peers_that_saw_the_want() {
        let wl = want_list();
        let (p1, p2) = (PeerId::random(), PeerId::random());
        wl.connected(p1).await;

        let c = cid(1);
        wl.want_blocks(
            &[c],
            WantOptions {
                session: vec![p1],
                ..Default::default()
            },
        )
        .await;
        wl.connected(p2).await;
        assert!(wl.is_sent(&p1, &c));
        assert!(!wl.is_sent(&p2, &c));
        take_sent(&wl, &p1);
        assert!(take_sent(&wl, &p2).is_empty());

        wl.cancel_wants(&[c]).await;
        let sent = take_sent(&wl, &p1);
        assert_eq!(sent.len(), 1);
        let entry = sent[0].wantlist().next().unwrap();
        assert!(entry.cancel);
        assert_eq!(entry.cid, c);
        assert!(take_sent(&wl, &p2).is_empty());

        // every peer that saw the want got the cancel
        assert!(wl.get(&c).is_none());
        assert!(wl.entries().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kept_until_delivered() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        take_sent(&wl, &peer);

        // a cancel that cannot be delivered keeps the entry around
        let mut state = wl.inner.state.lock().unwrap();
        state.cancel(&BlockKey::from(&c));
        state.purge();
        assert!(state.wants.contains_key(&BlockKey::from(&c)));
        drop(state);

        wl.send_wants().await;
        assert!(wl.get(&c).is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        wl.cancel_wants(&[cid(9)]).await;
        assert!(take_sent(&wl, &peer).is_empty());
    }

    #[tokio::test]
    async fn test_unwant_sends_nothing() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        take_sent(&wl, &peer);

        wl.unwant_blocks(&[c]);
        wl.send_wants().await;
        assert!(take_sent(&wl, &peer).is_empty());
        assert!(wl.get(&c).is_none());
        assert!(!wl.is_sent(&peer, &c));
    }

    #[tokio::test]
    async fn test_connected_sends_full_scoped_list() {
        let wl = want_list();
        let (p1, p2) = (PeerId::random(), PeerId::random());
        let (global, scoped, cancelled) = (cid(1), cid(2), cid(3));
        wl.want_blocks(
            &[global],
            WantOptions {
                priority: Some(1),
                ..Default::default()
            },
        )
        .await;
        wl.want_blocks(
            &[scoped],
            WantOptions {
                session: vec![p2],
                priority: Some(5),
                ..Default::default()
            },
        )
        .await;
        wl.want_blocks(&[cancelled], WantOptions::default()).await;
        wl.cancel_wants(&[cancelled]).await;

        wl.connected(p1).await;
        let sent = take_sent(&wl, &p1);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].full());
        assert_eq!(sent[0].wantlist().map(|e| e.cid).collect::<Vec<_>>(), vec![global]);

        wl.connected(p2).await;
        let sent = take_sent(&wl, &p2);
        assert!(sent[0].full());
        // highest priority first
        assert_eq!(
            sent[0].wantlist().map(|e| e.cid).collect::<Vec<_>>(),
            vec![scoped, global]
        );
    }

    #[tokio::test]
    async fn test_disconnected_drops_sent_set() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;
        assert!(wl.is_sent(&peer, &c));

        wl.disconnected(&peer);
        assert!(!wl.is_sent(&peer, &c));
        assert!(wl.peers().is_empty());
        // the want itself is untouched
        assert!(wl.get(&c).is_some());
    }

    #[tokio::test]
    async fn test_want_block_resolves_on_block() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let block = create_block_v1(&b"payload"[..]);

        let waiter = {
            let wl = wl.clone();
            let cid = block.cid;
            tokio::spawn(async move {
                wl.want_block(cid, WantOptions::default(), &CancellationToken::new())
                    .await
            })
        };
        while !wl.is_sent(&peer, &block.cid) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        take_sent(&wl, &peer);

        let mut message = BitswapMessage::new(false);
        message.add_block(block.clone());
        wl.received_message(&peer, &message).await;

        assert_eq!(waiter.await.unwrap().unwrap(), block.data);
        // the want was cancelled at the peer
        let sent = take_sent(&wl, &peer);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].wantlist().next().unwrap().cancel);
        assert!(wl.get(&block.cid).is_none());
    }

    #[tokio::test]
    async fn test_unwanted_block_counts_as_duplicate() {
        let wl = want_list();
        let peer = PeerId::random();
        let mut message = BitswapMessage::new(false);
        message.add_block(create_block_v1(&b"surprise"[..]));
        wl.received_message(&peer, &message).await;

        let metrics = wl.inner.network.metrics();
        assert_eq!(metrics.blocks_received.get(), 1);
        assert_eq!(metrics.dup_blocks_received.get(), 1);
        assert_eq!(metrics.dup_bytes_received.get(), 8);
    }

    #[tokio::test]
    async fn test_want_presence() {
        let wl = want_list();
        let (p1, p2) = (PeerId::random(), PeerId::random());
        wl.connected(p1).await;
        wl.connected(p2).await;
        let c = cid(1);

        let ask = |peer| {
            let wl = wl.clone();
            tokio::spawn(async move { wl.want_presence(c, peer, &CancellationToken::new()).await })
        };
        let (w1, w2) = (ask(p1), ask(p2));
        while !(wl.is_sent(&p1, &c) && wl.is_sent(&p2, &c)) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let sent = take_sent(&wl, &p1);
        let entry = sent[0].wantlist().next().unwrap();
        assert_eq!(entry.want_type, WantType::Have);
        assert!(entry.send_dont_have);

        let mut have = BitswapMessage::new(false);
        have.add_have(c);
        wl.received_message(&p1, &have).await;
        let mut dont_have = BitswapMessage::new(false);
        dont_have.add_dont_have(c);
        wl.received_message(&p2, &dont_have).await;

        assert!(w1.await.unwrap().unwrap());
        assert!(!w2.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_block_answers_presence_and_block_waiters() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let block = create_block_v1(&b"small"[..]);
        let c = block.cid;

        let presence = {
            let wl = wl.clone();
            tokio::spawn(async move { wl.want_presence(c, peer, &CancellationToken::new()).await })
        };
        let fetch = {
            let wl = wl.clone();
            tokio::spawn(async move {
                wl.want_block(c, WantOptions::default(), &CancellationToken::new())
                    .await
            })
        };
        while wl
            .inner
            .state
            .lock()
            .unwrap()
            .waiters
            .get(&BlockKey::from(&c))
            .map_or(0, |w| w.len())
            < 2
        {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut message = BitswapMessage::new(false);
        message.add_block(block.clone());
        wl.received_message(&peer, &message).await;

        assert!(presence.await.unwrap().unwrap());
        assert_eq!(fetch.await.unwrap().unwrap(), block.data);
    }

    #[tokio::test]
    async fn test_dont_have_fails_scoped_block_waiter() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);

        let waiter = {
            let wl = wl.clone();
            tokio::spawn(async move { wl.want_block_from(c, peer, &CancellationToken::new()).await })
        };
        while !wl.is_sent(&peer, &c) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let mut dont_have = BitswapMessage::new(false);
        dont_have.add_dont_have(c);
        wl.received_message(&peer, &dont_have).await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::DontHave { peer: p } if p == peer));
    }

    #[tokio::test]
    async fn test_disconnect_fails_scoped_waiter() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);

        let waiter = {
            let wl = wl.clone();
            tokio::spawn(async move { wl.want_block_from(c, peer, &CancellationToken::new()).await })
        };
        while !wl.is_sent(&peer, &c) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wl.disconnected(&peer);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::PeerDisconnected { .. }));
    }

    #[tokio::test]
    async fn test_aborted_waiter_cancels_want() {
        let wl = want_list();
        let peer = PeerId::random();
        wl.connected(peer).await;
        let c = cid(1);

        let cancel = CancellationToken::new();
        let waiter = {
            let wl = wl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { wl.want_block(c, WantOptions::default(), &cancel).await })
        };
        while !wl.is_sent(&peer, &c) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        take_sent(&wl, &peer);

        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Aborted)));

        // the cancel goes out from a background send pass
        while wl.get(&c).is_some() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let sent = take_sent(&wl, &peer);
        assert!(sent[0].wantlist().next().unwrap().cancel);
    }

    #[tokio::test]
    async fn test_pinned_want_survives_waiters() {
        let wl = want_list();
        let c = cid(1);
        wl.want_blocks(&[c], WantOptions::default()).await;

        let cancel = CancellationToken::new();
        let waiter = {
            let wl = wl.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { wl.want_block(c, WantOptions::default(), &cancel).await })
        };
        while !wl.inner.state.lock().unwrap().waiters.contains_key(&BlockKey::from(&c)) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Aborted)));
        assert!(!wl.get(&c).unwrap().cancel);
    }

    #[tokio::test]
    async fn test_local_block_resolves_waiter() {
        let wl = want_list();
        let block = create_block_v1(&b"local"[..]);
        let waiter = {
            let wl = wl.clone();
            let cid = block.cid;
            tokio::spawn(async move {
                wl.want_block(cid, WantOptions::default(), &CancellationToken::new())
                    .await
            })
        };
        while wl.get(&block.cid).is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        wl.received_block(&block.cid, &block.data).await;
        assert_eq!(waiter.await.unwrap().unwrap(), block.data);
    }
}
