use std::convert::TryFrom;

use cid::{Cid, Version};
use multihash::{Code, MultihashDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use crate::error::Error;

/// Prefix represents all metadata of a CID, without the actual content.
///
/// Blocks travel as `(prefix, data)` pairs, the receiver rebuilds the CID by hashing `data`.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Prefix {
    /// The version of CID.
    pub version: Version,
    /// The codec of CID.
    pub codec: u64,
    /// The multihash code of CID.
    pub mh_type: u64,
    /// The multihash length of CID.
    pub mh_len: usize,
}

impl Prefix {
    /// Create a new prefix from encoded bytes.
    pub fn new(data: &[u8]) -> Result<Prefix, Error> {
        let (raw_version, remain) = varint_decode::u64(data)?;
        let version = Version::try_from(raw_version)?;
        let (codec, remain) = varint_decode::u64(remain)?;
        let (mh_type, remain) = varint_decode::u64(remain)?;
        let (mh_len, _remain) = varint_decode::usize(remain)?;

        Ok(Prefix {
            version,
            codec,
            mh_type,
            mh_len,
        })
    }

    /// Convert the prefix to encoded bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(4);

        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.version.into(), &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.codec, &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.mh_type, &mut buf));
        let mut buf = varint_encode::u64_buffer();
        res.extend_from_slice(varint_encode::u64(self.mh_len as u64, &mut buf));

        res
    }

    /// Create a CID out of the prefix and some data that will be hashed.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, Error> {
        let code = Code::try_from(self.mh_type)?;
        let mh = code.digest(data);
        let cid = Cid::new(self.version, self.codec, mh)?;
        Ok(cid)
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Self {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().digest().len(),
        }
    }
}
