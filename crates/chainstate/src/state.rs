use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use marabud_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
use marabud_primitives::{jcs, Block, Object, Transaction};
use marabud_storage::{Column, KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::utxo::UtxoEntry;

const CHAINTIP_KEY: &[u8] = b"chaintip";
const HEIGHT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    Corrupt(String),
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Corrupt(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

fn corrupt(message: impl Into<String>) -> ChainStateError {
    ChainStateError::Corrupt(message.into())
}

mod hash_hex {
    use marabud_consensus::{hash256_from_hex, hash256_to_hex, Hash256};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash256_to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash256, D::Error> {
        let text = String::deserialize(deserializer)?;
        hash256_from_hex(&text).ok_or_else(|| D::Error::custom("invalid hash hex"))
    }
}

/// The highest valid block seen, persisted as a singleton under the meta
/// column.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChainTip {
    #[serde(with = "hash_hex")]
    pub hash: Hash256,
    pub block: Block,
    pub height: i64,
}

struct HeightCache {
    entries: HashMap<Hash256, i64>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl HeightCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<i64> {
        self.entries.get(hash).copied()
    }

    fn insert(&mut self, hash: Hash256, height: i64) {
        if self.entries.insert(hash, height).is_none() {
            self.order.push_back(hash);
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }
}

/// Object store, UTXO index and chaintip over one key-value store.
pub struct ChainState<S> {
    store: Arc<S>,
    heights: Mutex<HeightCache>,
    tip_lock: Mutex<()>,
}

impl<S> ChainState<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            heights: Mutex::new(HeightCache::new(HEIGHT_CACHE_CAPACITY)),
            tip_lock: Mutex::new(()),
        }
    }
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn object_exists(&self, id: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self
            .store
            .exists(Column::Objects, hash256_to_hex(id).as_bytes())?)
    }

    /// The stored canonical serialization of an object, for serving
    /// `getobject` without a re-encode.
    pub fn object_bytes(&self, id: &Hash256) -> Result<Option<Vec<u8>>, ChainStateError> {
        Ok(self
            .store
            .get(Column::Objects, hash256_to_hex(id).as_bytes())?)
    }

    pub fn object(&self, id: &Hash256) -> Result<Option<Object>, ChainStateError> {
        let Some(bytes) = self.object_bytes(id)? else {
            return Ok(None);
        };
        let object = serde_json::from_slice(&bytes)
            .map_err(|err| corrupt(format!("stored object {}: {err}", hash256_to_hex(id))))?;
        Ok(Some(object))
    }

    pub fn block(&self, id: &Hash256) -> Result<Option<Block>, ChainStateError> {
        match self.object(id)? {
            Some(Object::Block(block)) => Ok(Some(block)),
            _ => Ok(None),
        }
    }

    pub fn transaction(&self, id: &Hash256) -> Result<Option<Transaction>, ChainStateError> {
        match self.object(id)? {
            Some(Object::Transaction(tx)) => Ok(Some(tx)),
            _ => Ok(None),
        }
    }

    /// Stores a validated object under its id. Write-once: if the id is
    /// already present this is a no-op. Returns whether the object was
    /// newly stored.
    pub fn put_object(&self, id: &Hash256, object: &Object) -> Result<bool, ChainStateError> {
        let key = hash256_to_hex(id);
        if self.store.exists(Column::Objects, key.as_bytes())? {
            return Ok(false);
        }
        let value = serde_json::to_value(object)
            .map_err(|err| corrupt(format!("encode object: {err}")))?;
        self.store
            .put(Column::Objects, key.as_bytes(), &jcs::to_canonical_vec(&value))?;
        Ok(true)
    }

    pub fn utxo_set(&self, block_id: &Hash256) -> Result<Option<Vec<UtxoEntry>>, ChainStateError> {
        let Some(bytes) = self
            .store
            .get(Column::Utxo, hash256_to_hex(block_id).as_bytes())?
        else {
            return Ok(None);
        };
        let entries = serde_json::from_slice(&bytes)
            .map_err(|err| corrupt(format!("stored utxo set: {err}")))?;
        Ok(Some(entries))
    }

    pub fn put_utxo_set(
        &self,
        block_id: &Hash256,
        entries: &[UtxoEntry],
    ) -> Result<(), ChainStateError> {
        let bytes = serde_json::to_vec(entries)
            .map_err(|err| corrupt(format!("encode utxo set: {err}")))?;
        self.store
            .put(Column::Utxo, hash256_to_hex(block_id).as_bytes(), &bytes)?;
        Ok(())
    }

    pub fn chaintip(&self) -> Result<Option<ChainTip>, ChainStateError> {
        let Some(bytes) = self.store.get(Column::Meta, CHAINTIP_KEY)? else {
            return Ok(None);
        };
        let tip = serde_json::from_slice(&bytes)
            .map_err(|err| corrupt(format!("stored chaintip: {err}")))?;
        Ok(Some(tip))
    }

    /// Makes `candidate` the chaintip if its height strictly exceeds the
    /// stored tip's. The read and the write happen under one lock, so
    /// concurrently validated blocks cannot regress the tip: whichever
    /// commits first, the later candidate is re-compared against it. The
    /// caller must have persisted the candidate block's UTXO set first so
    /// the two move together.
    ///
    /// Returns `Some(displaced)` when the candidate became the tip, or
    /// `None` when the stored tip was already at least as high.
    pub fn advance_tip(
        &self,
        candidate: &ChainTip,
    ) -> Result<Option<Option<ChainTip>>, ChainStateError> {
        let _guard = self
            .tip_lock
            .lock()
            .map_err(|_| corrupt("tip lock poisoned"))?;
        let current = self.chaintip()?;
        let advances = current
            .as_ref()
            .map(|tip| candidate.height > tip.height)
            .unwrap_or(true);
        if !advances {
            return Ok(None);
        }
        let bytes = serde_json::to_vec(candidate)
            .map_err(|err| corrupt(format!("encode chaintip: {err}")))?;
        self.store.put(Column::Meta, CHAINTIP_KEY, &bytes)?;
        Ok(Some(current))
    }

    pub fn note_height(&self, id: &Hash256, height: i64) {
        if let Ok(mut heights) = self.heights.lock() {
            heights.insert(*id, height);
        }
    }

    /// Height of a stored block, walking `previd` links back to genesis
    /// (height 0). Results are cached, so steady-state lookups touch only
    /// the immediate parent.
    pub fn block_height(&self, id: &Hash256, block: &Block) -> Result<i64, ChainStateError> {
        if let Ok(heights) = self.heights.lock() {
            if let Some(height) = heights.get(id) {
                return Ok(height);
            }
        }

        let mut path = vec![*id];
        let mut current = block.clone();
        let base_height = loop {
            let Some(prev_hex) = &current.previd.0 else {
                // The deepest entry in `path` is the genesis block.
                break -1i64;
            };
            let prev = hash256_from_hex(prev_hex)
                .ok_or_else(|| corrupt("stored block has malformed previd"))?;
            let cached = self
                .heights
                .lock()
                .ok()
                .and_then(|heights| heights.get(&prev));
            if let Some(height) = cached {
                break height;
            }
            let parent = self
                .block(&prev)?
                .ok_or_else(|| corrupt("ancestor of a stored block is missing"))?;
            path.push(prev);
            current = parent;
        };

        let mut height = base_height;
        if let Ok(mut heights) = self.heights.lock() {
            for hash in path.iter().rev() {
                height += 1;
                heights.insert(*hash, height);
            }
        } else {
            height += path.len() as i64;
        }
        Ok(height)
    }

    /// Non-coinbase transactions sitting in blocks on `old`'s chain but
    /// not on `new`'s, oldest block first, in-block order preserved. These
    /// are the transactions a reorganization must offer back to the
    /// mempool.
    pub fn branch_transactions(
        &self,
        old: &ChainTip,
        new: &ChainTip,
    ) -> Result<Vec<(Hash256, Transaction)>, ChainStateError> {
        let mut old_cursor = Cursor {
            hash: old.hash,
            block: old.block.clone(),
            height: old.height,
        };
        let mut new_cursor = Cursor {
            hash: new.hash,
            block: new.block.clone(),
            height: new.height,
        };

        let mut old_branch: Vec<Block> = Vec::new();
        while new_cursor.height > old_cursor.height {
            new_cursor = self.parent_of(&new_cursor)?;
        }
        while old_cursor.height > new_cursor.height {
            old_branch.push(old_cursor.block.clone());
            old_cursor = self.parent_of(&old_cursor)?;
        }
        while old_cursor.hash != new_cursor.hash {
            old_branch.push(old_cursor.block.clone());
            old_cursor = self.parent_of(&old_cursor)?;
            new_cursor = self.parent_of(&new_cursor)?;
        }

        let mut forgotten = Vec::new();
        for block in old_branch.iter().rev() {
            for txid_hex in &block.txids {
                let txid = hash256_from_hex(txid_hex)
                    .ok_or_else(|| corrupt("stored block has malformed txid"))?;
                let tx = self
                    .transaction(&txid)?
                    .ok_or_else(|| corrupt("transaction of a stored block is missing"))?;
                if !tx.is_coinbase() {
                    forgotten.push((txid, tx));
                }
            }
        }
        Ok(forgotten)
    }

    fn parent_of(&self, cursor: &Cursor) -> Result<Cursor, ChainStateError> {
        let prev_hex = cursor
            .block
            .previd
            .0
            .as_ref()
            .ok_or_else(|| corrupt("chain walk ran past genesis"))?;
        let hash = hash256_from_hex(prev_hex)
            .ok_or_else(|| corrupt("stored block has malformed previd"))?;
        let block = self
            .block(&hash)?
            .ok_or_else(|| corrupt("ancestor of a stored block is missing"))?;
        Ok(Cursor {
            hash,
            block,
            height: cursor.height - 1,
        })
    }
}

struct Cursor {
    hash: Hash256,
    block: Block,
    height: i64,
}
