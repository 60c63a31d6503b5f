//! In-memory block store.
//!
//! Not optimised at all, meant for tests and small embedders.

use std::sync::{Arc, RwLock};

use ahash::AHashMap;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;

use crate::block::{Block, BlockKey};
use crate::Store;

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blocks: Arc<RwLock<AHashMap<BlockKey, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the block, returns `false` if it was already present.
    pub fn put(&self, block: &Block) -> bool {
        self.blocks
            .write()
            .unwrap()
            .insert(block.key(), block.data().clone())
            .is_none()
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.blocks.read().unwrap().contains_key(&BlockKey::from(cid))
    }

    pub fn len(&self) -> usize {
        self.blocks.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.blocks.read().unwrap().get(&BlockKey::from(cid)).cloned())
    }
}
