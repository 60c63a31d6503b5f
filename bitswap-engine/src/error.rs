use libp2p_identity::PeerId;
use thiserror::Error;

use crate::message::{BlockPresenceType, WantType};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error while decoding bitswap message: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("Error while parsing cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("Error while parsing multihash: {0}")]
    Multihash(#[from] multihash::Error),
    #[error("Error while decoding varint: {0}")]
    Varint(#[from] unsigned_varint::decode::Error),
    #[error("Invalid block presence type {0}")]
    InvalidBlockPresenceType(#[from] num_enum::TryFromPrimitiveError<BlockPresenceType>),
    #[error("Invalid want type {0}")]
    InvalidWantType(#[from] num_enum::TryFromPrimitiveError<WantType>),
    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Block of {size} bytes exceeds the maximum block size of {max} bytes")]
    BlockTooLarge { size: usize, max: usize },
    #[error("Found {found} of {required} required providers")]
    InsufficientProviders { found: usize, required: usize },
    #[error("Session has no peers")]
    NoSessionPeers,
    #[error("All {} session peers failed", .0.len())]
    AllPeersFailed(Vec<Error>),
    #[error("Peer {peer} does not have the block")]
    DontHave { peer: PeerId },
    #[error("Peer {peer} disconnected")]
    PeerDisconnected { peer: PeerId },
    #[error("Operation was aborted")]
    Aborted,
    #[error("Operation timed out")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
