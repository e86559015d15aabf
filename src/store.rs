/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits for the persistent store of relevant blocks.
//!
//! Relevant blocks may be kept in a key-value store of the library user's own choosing, as long as that
//! KV store can provide a type that implements [KVStore]. Raw blocks pass through an injected
//! [codec](BlockCodec) on their way in and out of storage; [BorshBlockCodec] is the default.
//!
//! ## State variables
//!
//! The store keeps two conceptual 'variables', each at a particular key path or prefix in the library
//! user's chosen KV store:
//! - **Blocks** (base64 of [CryptoHash] -> encoded [Block]): one record per relevant block, written at
//!   most once, never updated, never deleted.
//! - **Block Keys** ([Vec<CryptoHash>]): the index that backs [RelevantBlockStore::keys]. Updated in
//!   the same write batch as the record it indexes, so the two cannot diverge.
//!
//! Idempotence is a property of the write path, not of the storage layer: [RelevantBlockStore::insert]
//! probes for an existing record before writing, and the store assumes a single writer per record. The
//! underlying KV store is never asked to deduplicate.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{Block, CryptoHash};

/// A handle to the library user's chosen KV store. Writes are submitted in batches which must be
/// applied atomically: either every operation in the batch is durably written, or none is.
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// The contract between the store and the base chain's native block serialization.
///
/// `decode` receives the record's key hash alongside its bytes and must reconstruct enough of the
/// block's identity, at least its hash and height, for the replay engine to order and label it.
pub trait BlockCodec: Clone + Send + 'static {
    fn encode(&self, block: &Block) -> Vec<u8>;
    fn decode(&self, bytes: &[u8], hash: &CryptoHash) -> Result<Block, DecodeError>;
}

/// A stored record failed to decode. A record is only ever written through [BlockCodec::encode], so
/// this indicates a corrupted store or a codec mismatch and is fatal to the replay pass that hit it.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub hash: CryptoHash,
}

/// The default codec: blocks are stored as their borsh encoding, and the hash is restored from the
/// record key on the way out.
#[derive(Clone)]
pub struct BorshBlockCodec;

impl BlockCodec for BorshBlockCodec {
    fn encode(&self, block: &Block) -> Vec<u8> {
        block.try_to_vec().unwrap()
    }

    fn decode(&self, bytes: &[u8], hash: &CryptoHash) -> Result<Block, DecodeError> {
        let mut block =
            Block::deserialize(&mut &bytes[..]).map_err(|_| DecodeError { hash: *hash })?;
        block.hash = *hash;
        Ok(block)
    }
}

/// Whether an [insert](RelevantBlockStore::insert) wrote a new record or found one already present.
/// Finding one is not an error: the backfill loop may legitimately revisit heights across restarts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InsertOutcome {
    Stored,
    AlreadyStored,
}

/// The append-only store of relevant blocks, keyed by block hash.
#[derive(Clone)]
pub struct RelevantBlockStore<K: KVStore, C: BlockCodec> {
    kv: K,
    codec: C,
}

impl<K: KVStore, C: BlockCodec> RelevantBlockStore<K, C> {
    pub fn new(kv_store: K, codec: C) -> RelevantBlockStore<K, C> {
        RelevantBlockStore { kv: kv_store, codec }
    }

    pub fn contains(&self, hash: &CryptoHash) -> bool {
        self.kv.get(&block_key(hash)).is_some()
    }

    /// Write the block's record and the updated key index in one atomic batch, unless a record for
    /// this hash already exists, in which case nothing is written.
    pub fn insert(&mut self, block: &Block) -> InsertOutcome {
        if self.contains(&block.hash) {
            return InsertOutcome::AlreadyStored;
        }

        let mut keys = self.keys();
        keys.push(block.hash);

        let mut wb = K::WriteBatch::new();
        wb.set(&block_key(&block.hash), &self.codec.encode(block));
        wb.set(&paths::BLOCK_KEYS, &keys.try_to_vec().unwrap());
        self.kv.write(wb);

        InsertOutcome::Stored
    }

    /// The hashes of every stored block. Enumeration order carries no meaning; callers that need
    /// chain order must sort by height themselves.
    pub fn keys(&self) -> Vec<CryptoHash> {
        match self.kv.get(&paths::BLOCK_KEYS) {
            // Safety: the key index is only ever written by `insert`, as a borsh-encoded Vec.
            Some(bytes) => Vec::<CryptoHash>::deserialize(&mut &bytes[..]).unwrap(),
            None => Vec::new(),
        }
    }

    pub fn block(&self, hash: &CryptoHash) -> Result<Option<Block>, DecodeError> {
        match self.kv.get(&block_key(hash)) {
            Some(bytes) => self.codec.decode(&bytes, hash).map(Some),
            None => Ok(None),
        }
    }
}

fn block_key(hash: &CryptoHash) -> Vec<u8> {
    combine(&paths::BLOCKS, STANDARD.encode(hash).as_bytes())
}

fn combine(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut res = Vec::with_capacity(a.len() + b.len());
    res.extend_from_slice(a);
    res.extend_from_slice(b);
    res
}

mod paths {
    pub(super) const BLOCKS: [u8; 1] = [0];
    pub(super) const BLOCK_KEYS: [u8; 1] = [1];
}
