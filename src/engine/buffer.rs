use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use super::storage::{BlockFile, BLOCK_SIZE};
use crate::error::{DbError, Result};

/// Number of store ids the manager can hand out.
const MAX_STORES: usize = 8 * 8192;

/// Process-unique identifier of an open [`Store`](super::Store).
///
/// Ids are handed out by the [`BlockManager`] so that blocks from different
/// stores never collide in the shared cache. Id 0 is never allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(pub u32);

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache key of a block: the owning store plus the block index in its file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub store: StoreId,
    pub index: u64,
}

struct BlockState {
    data: Box<[u8]>,
    dirty: bool,
    /// set once the block has left the cache; writers must refetch
    evicted: bool,
}

/// A cached copy of one fixed-size block.
///
/// The block is owned by its store and only cached here. Writers go through
/// [`Block::modify`], which refuses to touch a block that has already been
/// evicted so that no update can land in a copy the cache no longer tracks.
pub struct Block {
    key: BlockKey,
    file: Arc<BlockFile>,
    state: RwLock<BlockState>,
}

impl Block {
    fn new(key: BlockKey, file: Arc<BlockFile>, data: Box<[u8]>) -> Self {
        Self {
            key,
            file,
            state: RwLock::new(BlockState {
                data,
                dirty: false,
                evicted: false,
            }),
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    /// Runs `f` over the block contents under a shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let state = self.state.read();
        f(&state.data)
    }

    /// Runs `f` over the block contents under the exclusive lock and marks
    /// the block dirty. Hands `f` back untouched if the block was evicted in
    /// the meantime, in which case the caller fetches a fresh copy.
    pub fn modify<R, F>(&self, f: F) -> std::result::Result<R, F>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut state = self.state.write();
        if state.evicted {
            return Err(f);
        }
        let r = f(&mut state.data);
        state.dirty = true;
        Ok(r)
    }

    pub fn is_dirty(&self) -> bool {
        self.state.read().dirty
    }

    fn write_back(&self, state: &mut BlockState) -> Result<()> {
        if state.dirty {
            self.file.write_block(self.key.index, &state.data)?;
            state.dirty = false;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.write();
        self.write_back(&mut state)
    }
}

/// Shared, capacity-bounded cache of blocks for every table in the process.
///
/// The manager sits between each [`Store`](super::Store) and its file. A
/// fetch either hits a resident block or loads it from disk; when the cache
/// is full the least recently used block is evicted first, and written back
/// if it is dirty.
///
/// ```text
/// Store.read(id) → BlockManager.get_block() → LRU hit? → return block
///                                  ↓ miss
///                  full? → pop LRU → write back if dirty
///                                  ↓
///                  load from BlockFile → insert → return block
/// ```
///
/// ## Capacity
/// The resident block count never exceeds the configured capacity: eviction
/// and insertion happen under one cache lock. [`ensure_capacity`] may grow
/// the bound but never shrinks it.
///
/// [`ensure_capacity`]: BlockManager::ensure_capacity
pub struct BlockManager {
    cache: Mutex<LruCache<BlockKey, Arc<Block>>>,
    store_mask: Mutex<Vec<u8>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockManager {
    /// Creates a manager holding at most `capacity_blocks` blocks.
    pub fn create(capacity_blocks: usize) -> Arc<Self> {
        let cap = NonZeroUsize::new(capacity_blocks.max(1)).unwrap_or(NonZeroUsize::MIN);
        let mut store_mask = vec![0u8; MAX_STORES / 8];
        // id 0 stays reserved so a zero id is always invalid
        store_mask[0] |= 1;

        debug!(capacity = cap.get(), "block manager created");

        Arc::new(Self {
            cache: Mutex::new(LruCache::new(cap)),
            store_mask: Mutex::new(store_mask),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Grows the cache to hold at least `min_blocks` blocks.
    pub fn ensure_capacity(&self, min_blocks: usize) {
        let mut cache = self.cache.lock();
        if let Some(cap) = NonZeroUsize::new(min_blocks) {
            if cap > cache.cap() {
                debug!(from = cache.cap().get(), to = cap.get(), "growing block cache");
                cache.resize(cap);
            }
        }
    }

    /// Maximum number of cached blocks. Only grows.
    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    /// Number of blocks currently cached.
    pub fn resident_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Fetches served from the cache since creation.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Fetches that had to read the block from its file.
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Reserves an unused store id.
    ///
    /// ## Returns
    /// [`DbError::Full`] once every id in the table is taken.
    pub fn allocate_store_id(&self) -> Result<StoreId> {
        let mut mask = self.store_mask.lock();
        for (i, byte) in mask.iter_mut().enumerate() {
            if *byte != 0xff {
                for j in 0..8 {
                    if *byte & (1 << j) == 0 {
                        *byte |= 1 << j;
                        return Ok(StoreId((8 * i + j) as u32));
                    }
                }
            }
        }
        Err(DbError::Full("block manager store id table".to_string()))
    }

    /// Returns an id from [`BlockManager::allocate_store_id`] for reuse.
    /// Blocks still cached under it must be dropped first with
    /// [`BlockManager::free_store`].
    pub fn free_store_id(&self, id: StoreId) {
        if id.0 == 0 || id.0 as usize >= MAX_STORES {
            warn!(store = %id, "ignoring free of invalid store id");
            return;
        }
        let mut mask = self.store_mask.lock();
        mask[id.0 as usize / 8] &= !(1 << (id.0 % 8));
    }

    /// Returns the cached block, loading it from `file` on a miss.
    pub(crate) fn get_block(
        &self,
        store: StoreId,
        file: &Arc<BlockFile>,
        index: u64,
    ) -> Result<Arc<Block>> {
        let key = BlockKey { store, index };
        let mut cache = self.cache.lock();

        if let Some(block) = cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(block.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if cache.len() >= cache.cap().get() {
            if let Some((old_key, old_block)) = cache.pop_lru() {
                // written back before the cache lock is released so a
                // concurrent miss on the same key can't read stale bytes
                let mut state = old_block.state.write();
                state.evicted = true;
                if let Err(e) = old_block.write_back(&mut state) {
                    warn!(store = %old_key.store, block = old_key.index, error = %e,
                          "eviction write-back failed");
                    state.evicted = false;
                    drop(state);
                    cache.push(old_key, old_block);
                    return Err(e);
                }
            }
        }

        let mut data = vec![0u8; BLOCK_SIZE].into_boxed_slice();
        file.read_block(index, &mut data)?;

        let block = Arc::new(Block::new(key, file.clone(), data));
        cache.push(key, block.clone());
        Ok(block)
    }

    /// Writes every dirty block of `store` to its file.
    pub fn flush(&self, store: StoreId) -> Result<()> {
        let dirty: Vec<Arc<Block>> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(k, b)| k.store == store && b.is_dirty())
                .map(|(_, b)| b.clone())
                .collect()
        };
        for block in dirty {
            block.flush()?;
        }
        Ok(())
    }

    /// Drops every cached block of `store` without writing it.
    pub fn free_store(&self, store: StoreId) {
        let mut cache = self.cache.lock();
        let keys: Vec<BlockKey> = cache
            .iter()
            .filter(|(k, _)| k.store == store)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            if let Some(block) = cache.pop(&key) {
                block.state.write().evicted = true;
            }
        }
    }

    /// Drops one block from the cache, discarding unwritten changes.
    pub(crate) fn discard(&self, key: BlockKey) {
        if let Some(block) = self.cache.lock().pop(&key) {
            block.state.write().evicted = true;
        }
    }
}
