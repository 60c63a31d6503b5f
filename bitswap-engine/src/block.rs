use std::fmt;

use bytes::Bytes;
use cid::Cid;
use multihash::{Code, Multihash, MultihashDigest};

use crate::error::Error;

/// Codec of raw binary blocks.
const RAW: u64 = 0x55;

/// A wrapper around bytes with their `Cid`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(data: Bytes, cid: Cid) -> Self {
        Self { cid, data }
    }

    /// Creates a block from data received in the legacy `blocks` field, which is always
    /// a CIDv0 (dag-pb, sha2-256).
    pub fn from_v0_data(data: Bytes) -> Result<Self, Error> {
        let digest = Code::Sha2_256.digest(&data);
        let cid = Cid::new_v0(digest)?;
        Ok(Block::new(data, cid))
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::from(&self.cid)
    }
}

/// Key under which wants, ledgers and messages track a block.
///
/// Built from the multihash only, so a CIDv0 and a CIDv1 (or two different codecs) pointing at
/// the same bytes collapse into one entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey(Multihash);

impl From<&Cid> for BlockKey {
    fn from(cid: &Cid) -> Self {
        BlockKey(*cid.hash())
    }
}

impl From<Cid> for BlockKey {
    fn from(cid: Cid) -> Self {
        BlockKey(*cid.hash())
    }
}

impl fmt::Debug for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockKey(")?;
        for byte in self.0.digest() {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Creates a raw CIDv1 block (sha2-256) for the given bytes.
pub fn create_block_v1<B: Into<Bytes>>(bytes: B) -> Block {
    let bytes = bytes.into();
    let digest = Code::Sha2_256.digest(&bytes);
    let cid = Cid::new_v1(RAW, digest);
    Block::new(bytes, cid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_block_v0(bytes: &'static [u8]) -> Block {
        Block::from_v0_data(Bytes::from_static(bytes)).unwrap()
    }

    #[test]
    fn test_key_ignores_cid_version() {
        let v0 = create_block_v0(&b"hello world"[..]);
        let v1 = create_block_v1(&b"hello world"[..]);
        assert_ne!(v0.cid, v1.cid);
        assert_eq!(v0.key(), v1.key());

        let other = create_block_v1(&b"hello there"[..]);
        assert_ne!(v1.key(), other.key());
    }

    #[test]
    fn test_from_v0_data() {
        let block = Block::from_v0_data(Bytes::from_static(b"legacy")).unwrap();
        assert_eq!(block.cid.version(), cid::Version::V0);
        assert_eq!(block.cid.codec(), 0x70);
        assert_eq!(block.cid.hash(), &Code::Sha2_256.digest(b"legacy"));
    }
}
