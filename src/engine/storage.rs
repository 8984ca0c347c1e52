use parking_lot::Mutex;
use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

use super::buffer::{BlockKey, BlockManager, StoreId};
use crate::error::{DbError, Result};

pub const BLOCK_BITS: u32 = 13;

/// Size of every block in every store (8 KiB). All store I/O happens in
/// units of exactly this many bytes.
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;

/// Number of blocks described by one allocation table block. Block
/// `g * ALLOC_GROUP` holds the codes for blocks `g * ALLOC_GROUP ..
/// (g + 1) * ALLOC_GROUP`, itself included.
const ALLOC_GROUP: u64 = BLOCK_SIZE as u64;
/// Block 1 holds the table header.
const HEADER_BLOCK: u64 = 1;
/// First block index available to callers.
pub const FIRST_DATA_BLOCK: u64 = 2;

/// Index of the allocation table block describing `index`.
fn alloc_block_of(index: u64) -> u64 {
    index & !(ALLOC_GROUP - 1)
}

fn is_alloc_block(index: u64) -> bool {
    index % ALLOC_GROUP == 0
}

/// Allocation code of a block, as stored in the allocation table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockKind {
    Free = 0x00,
    Row = 0x01,
    Used = 0x02,
}

impl BlockKind {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(BlockKind::Free),
            0x01 => Some(BlockKind::Row),
            0x02 => Some(BlockKind::Used),
            _ => None,
        }
    }
}

/// Index of a block within its store's file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block-granular access to one file.
///
/// Reads past the end of the file return zeroed blocks; writes past the end
/// extend it.
pub struct BlockFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl BlockFile {
    /// Creates a new file, failing if one already exists at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn read_block(&self, index: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index << BLOCK_BITS))?;

        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    pub fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(index << BLOCK_BITS))?;
        file.write_all(data)?;
        if data.len() < BLOCK_SIZE {
            file.write_all(&vec![0u8; BLOCK_SIZE - data.len()])?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

/// Block-structured persistent file backing one table, `<name>.db`.
///
/// ## File Layout
/// ```text
/// name.db:
/// [alloc 0][header][block 2]...[block 8191][alloc 1][block 8193]...
///     |        |        └─ row or used blocks, or free
///     |        └─ table header, written once at create
///     └─ one allocation code (free / row / used) for each of the
///        8192 blocks of its group, itself included
/// ```
///
/// The file grows one group at a time: the first block of every 8192 is
/// an allocation table block, appended when allocation reaches it.
///
/// Data blocks are read and written through the shared [`BlockManager`];
/// the allocation tables and header bypass the cache.
pub struct Store {
    id: StoreId,
    name: String,
    file: Arc<BlockFile>,
    manager: Arc<BlockManager>,
    alloc: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl Store {
    /// Creates a new store file. Fails if the file already exists.
    pub fn create(manager: Arc<BlockManager>, path: impl Into<PathBuf>, name: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            return Err(DbError::TableExists(name.to_string()));
        }

        let file = BlockFile::create(&path)?;
        let alloc = vec![BlockKind::Used as u8, BlockKind::Used as u8];
        file.write_block(0, &alloc)?;
        file.write_block(HEADER_BLOCK, &[])?;

        debug!(store = name, path = %path.display(), "store created");
        Self::with_file(manager, file, name, alloc)
    }

    /// Opens an existing store file and loads its allocation table.
    pub fn open(manager: Arc<BlockManager>, path: impl Into<PathBuf>, name: &str) -> Result<Self> {
        let path = path.into();
        let file = BlockFile::open(&path)?;

        let len = file.len()?;
        let block_count = len.div_ceil(BLOCK_SIZE as u64) as usize;
        if block_count < FIRST_DATA_BLOCK as usize {
            return Err(DbError::Corrupt(name.to_string(), format!("file is only {len} bytes")));
        }

        let mut table = Vec::with_capacity(block_count);
        let mut group = vec![0u8; BLOCK_SIZE];
        for start in (0..block_count as u64).step_by(ALLOC_GROUP as usize) {
            file.read_block(start, &mut group)?;
            let end = block_count.min((start + ALLOC_GROUP) as usize);
            table.extend_from_slice(&group[..end - start as usize]);
        }

        let reserved_ok = table
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < FIRST_DATA_BLOCK as usize || is_alloc_block(*i as u64))
            .all(|(_, &code)| code == BlockKind::Used as u8);
        if !reserved_ok || table.iter().any(|&code| BlockKind::from_code(code).is_none()) {
            return Err(DbError::Corrupt(name.to_string(), "bad allocation table".to_string()));
        }

        debug!(store = name, blocks = block_count, "store opened");
        Self::with_file(manager, file, name, table)
    }

    fn with_file(manager: Arc<BlockManager>, file: BlockFile, name: &str, alloc: Vec<u8>) -> Result<Self> {
        let id = manager.allocate_store_id()?;
        Ok(Self {
            id,
            name: name.to_string(),
            file: Arc::new(file),
            manager,
            alloc: Mutex::new(alloc),
            closed: AtomicBool::new(false),
        })
    }

    /// The id this store's blocks are cached under in the [`BlockManager`].
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Table name the store was opened for, used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the backing `<name>.db` file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The block cache shared with the other stores of the database.
    pub fn block_manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    /// Number of blocks in the file, including the reserved ones.
    pub fn block_count(&self) -> u64 {
        self.alloc.lock().len() as u64
    }

    /// True once [`Store::close`] or [`Store::remove`] has run. Every
    /// later block operation fails with [`DbError::Closed`].
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Allocates a zeroed block of the given kind.
    pub fn allocate(&self, kind: BlockKind) -> Result<BlockId> {
        self.assert_active()?;
        if kind == BlockKind::Free {
            return Err(DbError::InvalidBlock { store: self.name.clone(), block: 0 });
        }

        let index = {
            let mut alloc = self.alloc.lock();
            let free = alloc
                .iter()
                .skip(FIRST_DATA_BLOCK as usize)
                .position(|&code| code == BlockKind::Free as u8)
                .map(|p| p + FIRST_DATA_BLOCK as usize);

            let index = match free {
                Some(index) => index,
                None => {
                    if alloc.len() as u64 == u64::MAX >> BLOCK_BITS {
                        return Err(DbError::Full(format!("store {}", self.name)));
                    }
                    if is_alloc_block(alloc.len() as u64) {
                        // first block of a new group: its allocation table
                        alloc.push(BlockKind::Used as u8);
                        debug!(store = %self, block = alloc.len() - 1, "allocation table grown");
                    }
                    alloc.len()
                }
            };

            // zero the block on disk before it becomes visible as allocated
            self.file.write_block(index as u64, &[])?;

            if index == alloc.len() {
                alloc.push(kind as u8);
            } else {
                alloc[index] = kind as u8;
            }
            self.write_alloc(&alloc, index as u64)?;
            index as u64
        };

        debug!(store = %self, block = index, ?kind, "allocated block");
        Ok(BlockId(index))
    }

    /// Returns a copy of the block contents.
    pub fn read(&self, id: BlockId) -> Result<Vec<u8>> {
        self.read_with(id, |data| data.to_vec())
    }

    /// Runs `f` over the block contents without copying them.
    pub fn read_with<R>(&self, id: BlockId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.check_block(id)?;
        let block = self.manager.get_block(self.id, &self.file, id.0)?;
        Ok(block.read(f))
    }

    /// Replaces the block contents with `data`, zero-filling the remainder.
    pub fn write(&self, id: BlockId, data: &[u8]) -> Result<()> {
        if data.len() > BLOCK_SIZE {
            return Err(DbError::InvalidBlock { store: self.name.clone(), block: id.0 });
        }
        self.update(id, |buf| {
            buf[..data.len()].copy_from_slice(data);
            buf[data.len()..].fill(0);
        })
    }

    /// Modifies the block in place. The change reaches the file when the
    /// block is flushed or evicted.
    pub fn update<R>(&self, id: BlockId, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.check_block(id)?;
        let mut f = f;
        loop {
            let block = self.manager.get_block(self.id, &self.file, id.0)?;
            match block.modify(f) {
                Ok(r) => return Ok(r),
                Err(back) => f = back,
            }
        }
    }

    /// Returns the block to the free list.
    pub fn free(&self, id: BlockId) -> Result<()> {
        self.check_block(id)?;
        {
            let mut alloc = self.alloc.lock();
            alloc[id.0 as usize] = BlockKind::Free as u8;
            self.write_alloc(&alloc, id.0)?;
        }
        self.manager.discard(BlockKey { store: self.id, index: id.0 });
        debug!(store = %self, block = id.0, "freed block");
        Ok(())
    }

    /// Returns the kind recorded for the block, `None` past the end of file
    /// or for the reserved header and allocation table blocks.
    pub fn kind(&self, id: BlockId) -> Result<Option<BlockKind>> {
        self.assert_active()?;
        Ok(self.data_kind(id))
    }

    /// Returns the first block of `kind` at or after `from`.
    pub fn first_block(&self, from: BlockId, kind: BlockKind) -> Result<Option<BlockId>> {
        self.assert_active()?;
        let alloc = self.alloc.lock();
        let start = from.0.max(FIRST_DATA_BLOCK) as usize;
        Ok(alloc
            .iter()
            .enumerate()
            .skip(start)
            .find(|(i, code)| **code == kind as u8 && !is_alloc_block(*i as u64))
            .map(|(i, _)| BlockId(i as u64)))
    }

    /// Returns every block of `kind`, in file order.
    pub fn blocks(&self, kind: BlockKind) -> Result<Vec<BlockId>> {
        self.assert_active()?;
        let alloc = self.alloc.lock();
        Ok(alloc
            .iter()
            .enumerate()
            .skip(FIRST_DATA_BLOCK as usize)
            .filter(|(i, code)| **code == kind as u8 && !is_alloc_block(*i as u64))
            .map(|(i, _)| BlockId(i as u64))
            .collect())
    }

    fn data_kind(&self, id: BlockId) -> Option<BlockKind> {
        if id.0 < FIRST_DATA_BLOCK || is_alloc_block(id.0) {
            return None;
        }
        let alloc = self.alloc.lock();
        alloc.get(id.0 as usize).and_then(|&code| BlockKind::from_code(code))
    }

    /// Writes the allocation table block of the group containing `index`.
    fn write_alloc(&self, alloc: &[u8], index: u64) -> Result<()> {
        let start = alloc_block_of(index);
        let end = (alloc.len() as u64).min(start + ALLOC_GROUP);
        self.file.write_block(start, &alloc[start as usize..end as usize])
    }

    /// Reads the whole header block.
    pub fn read_header(&self) -> Result<Vec<u8>> {
        self.assert_active()?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.file.read_block(HEADER_BLOCK, &mut buf)?;
        Ok(buf)
    }

    /// Replaces the header block with `data` and syncs the file.
    pub fn write_header(&self, data: &[u8]) -> Result<()> {
        self.assert_active()?;
        if data.len() > BLOCK_SIZE {
            return Err(DbError::Schema(format!(
                "header of {} is {} bytes, larger than a block",
                self.name,
                data.len()
            )));
        }
        self.file.write_block(HEADER_BLOCK, data)?;
        self.file.sync()
    }

    /// Writes dirty cached blocks to the file and syncs it.
    pub fn flush(&self) -> Result<()> {
        self.assert_active()?;
        self.manager.flush(self.id)?;
        self.file.sync()
    }

    /// Flushes and releases the store. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.manager.flush(self.id).and_then(|_| self.file.sync());

        self.manager.free_store(self.id);
        self.manager.free_store_id(self.id);

        debug!(store = %self, "store closed");
        flushed
    }

    /// Closes the store and deletes its file.
    pub fn remove(&self) -> Result<()> {
        if let Err(e) = self.close() {
            warn!(store = %self, error = %e, "close failed during remove");
        }
        fs::remove_file(self.file.path())?;
        debug!(store = %self, "store removed");
        Ok(())
    }

    fn assert_active(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn check_block(&self, id: BlockId) -> Result<()> {
        self.assert_active()?;
        let allocated = matches!(self.data_kind(id), Some(kind) if kind != BlockKind::Free);
        if !allocated {
            return Err(DbError::InvalidBlock { store: self.name.clone(), block: id.0 });
        }
        Ok(())
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store[{}:{}]", self.name, self.id)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(e) = self.close() {
                warn!(store = %self, error = %e, "close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_store(dir: &tempfile::TempDir, manager: &Arc<BlockManager>) -> Store {
        Store::create(manager.clone(), dir.path().join("t.db"), "t").unwrap()
    }

    #[test]
    fn allocate_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(16);
        let store = new_store(&dir, &manager);

        let id = store.allocate(BlockKind::Row).unwrap();
        assert_eq!(id, BlockId(FIRST_DATA_BLOCK));
        assert!(store.read(id).unwrap().iter().all(|&b| b == 0));

        store.write(id, b"hello").unwrap();
        let data = store.read(id).unwrap();
        assert_eq!(data.len(), BLOCK_SIZE);
        assert_eq!(&data[..5], b"hello");
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let _store = new_store(&dir, &manager);
        let err = Store::create(manager.clone(), dir.path().join("t.db"), "t").err().unwrap();
        assert!(matches!(err, DbError::TableExists(name) if name == "t"));
    }

    #[test]
    fn reserved_and_unallocated_blocks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let store = new_store(&dir, &manager);

        assert!(matches!(store.read(BlockId(0)), Err(DbError::InvalidBlock { .. })));
        assert!(matches!(store.read(BlockId(1)), Err(DbError::InvalidBlock { .. })));
        assert!(matches!(store.read(BlockId(7)), Err(DbError::InvalidBlock { .. })));
    }

    #[test]
    fn freed_blocks_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let store = new_store(&dir, &manager);

        let a = store.allocate(BlockKind::Used).unwrap();
        let b = store.allocate(BlockKind::Row).unwrap();
        store.write(a, &[9u8; 32]).unwrap();
        store.free(a).unwrap();
        assert!(store.read(a).is_err());
        assert_eq!(store.blocks(BlockKind::Row).unwrap(), vec![b]);

        let c = store.allocate(BlockKind::Row).unwrap();
        assert_eq!(c, a);
        assert!(store.read(c).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn contents_survive_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(2);
        let path = dir.path().join("t.db");
        let ids: Vec<BlockId> = {
            let store = new_store(&dir, &manager);
            store.write_header(b"header").unwrap();
            let ids: Vec<BlockId> = (0..5).map(|_| store.allocate(BlockKind::Row).unwrap()).collect();
            for (i, id) in ids.iter().enumerate() {
                store.write(*id, &[i as u8 + 1; 16]).unwrap();
            }
            store.close().unwrap();
            ids
        };

        let store = Store::open(manager.clone(), &path, "t").unwrap();
        assert_eq!(&store.read_header().unwrap()[..6], b"header");
        assert_eq!(store.blocks(BlockKind::Row).unwrap(), ids);
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(store.read(*id).unwrap()[0], i as u8 + 1);
        }
        assert_eq!(store.first_block(BlockId(0), BlockKind::Row).unwrap(), Some(ids[0]));
        assert_eq!(store.first_block(BlockId(ids[4].0 + 1), BlockKind::Row).unwrap(), None);
    }

    #[test]
    fn open_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.db");
        fs::write(&path, b"not a store").unwrap();
        let manager = BlockManager::create(4);
        assert!(matches!(
            Store::open(manager, &path, "bad"),
            Err(DbError::Corrupt(..))
        ));
    }

    #[test]
    fn closed_store_rejects_io_and_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let store = new_store(&dir, &manager);
        let id = store.allocate(BlockKind::Row).unwrap();
        store.remove().unwrap();
        assert!(store.is_closed());
        assert!(!dir.path().join("t.db").exists());
        assert!(matches!(store.read(id), Err(DbError::Closed(_))));
    }

    #[test]
    fn closed_store_rejects_block_listing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let store = new_store(&dir, &manager);
        let id = store.allocate(BlockKind::Row).unwrap();
        assert_eq!(store.kind(id).unwrap(), Some(BlockKind::Row));

        store.close().unwrap();
        assert!(matches!(store.kind(id), Err(DbError::Closed(_))));
        assert!(matches!(store.blocks(BlockKind::Row), Err(DbError::Closed(_))));
        assert!(matches!(
            store.first_block(BlockId(0), BlockKind::Row),
            Err(DbError::Closed(_))
        ));
    }

    #[test]
    fn allocation_table_grows_past_one_group() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let path = dir.path().join("t.db");
        let wanted = ALLOC_GROUP as usize + 8;

        let last = {
            let store = new_store(&dir, &manager);
            let ids: Vec<BlockId> = (0..wanted).map(|_| store.allocate(BlockKind::Row).unwrap()).collect();
            assert!(ids.iter().all(|id| !is_alloc_block(id.0)));
            assert_eq!(ids[ALLOC_GROUP as usize - 2], BlockId(ALLOC_GROUP + 1));
            assert_eq!(store.blocks(BlockKind::Row).unwrap().len(), wanted);
            assert_eq!(store.kind(BlockId(ALLOC_GROUP)).unwrap(), None);
            assert!(matches!(store.read(BlockId(ALLOC_GROUP)), Err(DbError::InvalidBlock { .. })));

            let last = ids[wanted - 1];
            store.write(last, b"tail").unwrap();
            store.free(ids[ALLOC_GROUP as usize]).unwrap();
            store.close().unwrap();
            last
        };

        let store = Store::open(manager.clone(), &path, "t").unwrap();
        assert_eq!(store.blocks(BlockKind::Row).unwrap().len(), wanted - 1);
        assert_eq!(&store.read(last).unwrap()[..4], b"tail");
        assert_eq!(store.allocate(BlockKind::Used).unwrap(), BlockId(ALLOC_GROUP + 3));
    }

    #[test]
    fn open_rejects_unknown_allocation_codes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BlockManager::create(4);
        let path = dir.path().join("t.db");
        {
            let store = new_store(&dir, &manager);
            store.allocate(BlockKind::Row).unwrap();
            store.close().unwrap();
        }
        // a block code this format does not define
        let file = BlockFile::open(&path).unwrap();
        file.write_block(0, &[0x02, 0x02, 0x03]).unwrap();
        drop(file);

        assert!(matches!(
            Store::open(manager, &path, "t"),
            Err(DbError::Corrupt(..))
        ));
    }
}
