use std::fmt::Debug;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::{BoxStream, StreamExt};
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::message::BitswapMessage;
use crate::metrics::Metrics;

/// Largest frame written to a peer.
pub const MAX_OUTGOING_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
/// Largest frame accepted from a peer.
pub const MAX_INCOMING_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
/// Largest block that can be put on the wire at all.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

const DEFAULT_DIAL_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub max_outgoing_message_size: usize,
    pub max_incoming_message_size: usize,
    pub max_block_size: usize,
    /// How many providers are dialed at the same time by a provider search.
    pub dial_concurrency: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            max_outgoing_message_size: MAX_OUTGOING_MESSAGE_SIZE,
            max_incoming_message_size: MAX_INCOMING_MESSAGE_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            dial_concurrency: DEFAULT_DIAL_CONCURRENCY,
        }
    }
}

/// The peer-to-peer layer the engine runs on.
///
/// Stream handling, connection management and content routing live behind this trait.
/// Incoming frames are handed back to the engine through
/// [`Bitswap::receive_frame`](crate::Bitswap::receive_frame).
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Writes a single encoded frame to the peer.
    async fn send_frame(&self, peer: PeerId, frame: Bytes) -> Result<()>;

    /// Streams peers that announced they provide `cid`.
    fn find_providers(&self, cid: Cid) -> BoxStream<'static, Result<PeerId>>;

    /// Makes sure there is a connection to `peer`.
    async fn dial(&self, peer: PeerId) -> Result<()>;
}

/// Frames messages for a [`Transport`] and tracks what went over the wire.
#[derive(Debug)]
pub struct Network<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Network<T> {
    fn clone(&self) -> Self {
        Network {
            inner: self.inner.clone(),
        }
    }
}

#[derive(Debug)]
struct Inner<T> {
    self_id: PeerId,
    transport: T,
    config: NetworkConfig,
    metrics: Metrics,
}

impl<T: Transport> Network<T> {
    pub fn new(self_id: PeerId, transport: T, config: NetworkConfig, metrics: Metrics) -> Self {
        Network {
            inner: Arc::new(Inner {
                self_id,
                transport,
                config,
                metrics,
            }),
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.inner.self_id
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Sends a message to the peer, split into as many frames as the size limit requires.
    ///
    /// Frames are written in order, the first failing frame aborts the rest.
    pub async fn send_message(&self, peer: PeerId, message: &BitswapMessage) -> Result<(), Error> {
        let config = &self.inner.config;
        let frames = message.frames(config.max_outgoing_message_size, config.max_block_size)?;

        let mut count = 0;
        for frame in frames {
            let len = frame.len();
            if let Err(err) = self.inner.transport.send_frame(peer, frame).await {
                self.inner.metrics.messages_failed.inc();
                debug!("failed to send frame {} ({} bytes) to {}: {:?}", count, len, peer, err);
                return Err(Error::Other(err));
            }
            trace!("sent frame {} ({} bytes) to {}", count, len, peer);
            count += 1;
        }
        self.inner.metrics.messages_sent.inc();

        Ok(())
    }

    /// Streams providers for `cid`, skipping routing errors and ourselves.
    pub fn find_providers(&self, cid: Cid) -> BoxStream<'static, PeerId> {
        let self_id = self.inner.self_id;
        self.inner
            .transport
            .find_providers(cid)
            .filter_map(move |res| async move {
                match res {
                    Ok(peer) if peer == self_id => None,
                    Ok(peer) => Some(peer),
                    Err(err) => {
                        warn!("provider query for {} failed: {:?}", cid, err);
                        None
                    }
                }
            })
            .boxed()
    }

    pub async fn dial(&self, peer: PeerId) -> Result<()> {
        self.inner.transport.dial(peer).await
    }

    /// Decodes an incoming frame, rejecting anything above the incoming size limit.
    pub fn decode(&self, frame: Bytes) -> Result<BitswapMessage, Error> {
        let max = self.inner.config.max_incoming_message_size;
        if frame.len() > max {
            return Err(Error::MessageTooLarge {
                size: frame.len(),
                max,
            });
        }
        BitswapMessage::try_from(frame)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use ahash::AHashSet;
    use futures::stream;

    use super::*;
    use crate::block::create_block_v1;

    /// Records frames and serves a fixed list of providers.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub frames: Mutex<Vec<(PeerId, Bytes)>>,
        pub providers: Vec<PeerId>,
        /// Every send fails.
        pub fail: bool,
        /// Sends to these peers fail.
        pub unreachable: Mutex<AHashSet<PeerId>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_frame(&self, peer: PeerId, frame: Bytes) -> Result<()> {
            if self.fail || self.unreachable.lock().unwrap().contains(&peer) {
                anyhow::bail!("{} is unreachable", peer);
            }
            self.frames.lock().unwrap().push((peer, frame));
            Ok(())
        }

        fn find_providers(&self, _cid: Cid) -> BoxStream<'static, Result<PeerId>> {
            let mut items: Vec<Result<PeerId>> = vec![Err(anyhow::anyhow!("routing hiccup"))];
            items.extend(self.providers.iter().copied().map(Ok));
            stream::iter(items).boxed()
        }

        async fn dial(&self, _peer: PeerId) -> Result<()> {
            Ok(())
        }
    }

    fn network(transport: RecordingTransport, config: NetworkConfig) -> Network<RecordingTransport> {
        Network::new(PeerId::random(), transport, config, Metrics::default())
    }

    #[tokio::test]
    async fn test_send_message_splits_frames() {
        let config = NetworkConfig {
            max_outgoing_message_size: 1024,
            ..Default::default()
        };
        let network = network(RecordingTransport::default(), config);
        let peer = PeerId::random();

        let mut message = BitswapMessage::new(false);
        for i in 0..4u8 {
            message.add_block(create_block_v1(vec![i; 700]));
        }
        network.send_message(peer, &message).await.unwrap();

        let frames = network.transport().frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 4);
        for (i, (to, frame)) in frames.into_iter().enumerate() {
            assert_eq!(to, peer);
            assert!(frame.len() <= 1024);
            let decoded = network.decode(frame).unwrap();
            assert_eq!(decoded.blocks().next().unwrap().data()[0], i as u8);
        }
        assert_eq!(network.metrics().messages_sent.get(), 1);
    }

    #[tokio::test]
    async fn test_send_message_failure() {
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let network = network(transport, NetworkConfig::default());
        let mut message = BitswapMessage::new(false);
        message.add_have(create_block_v1(&b"x"[..]).cid);

        assert!(network.send_message(PeerId::random(), &message).await.is_err());
        assert_eq!(network.metrics().messages_failed.get(), 1);
        assert_eq!(network.metrics().messages_sent.get(), 0);
    }

    #[tokio::test]
    async fn test_find_providers_skips_errors_and_self() {
        let other = PeerId::random();
        let mut network = network(RecordingTransport::default(), NetworkConfig::default());
        let self_id = *network.self_id();
        Arc::get_mut(&mut network.inner).unwrap().transport.providers = vec![self_id, other];

        let cid = create_block_v1(&b"x"[..]).cid;
        let found: Vec<_> = network.find_providers(cid).collect().await;
        assert_eq!(found, vec![other]);
    }

    #[test]
    fn test_decode_rejects_large_frames() {
        let config = NetworkConfig {
            max_incoming_message_size: 16,
            ..Default::default()
        };
        let network = network(RecordingTransport::default(), config);
        let mut message = BitswapMessage::new(false);
        message.add_block(create_block_v1(vec![1u8; 64]));

        let err = network.decode(message.encode()).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { max: 16, .. }));
    }
}
