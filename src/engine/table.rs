use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

use super::buffer::BlockManager;
use super::catalog::{Column, ColumnType, TableSchema, ROW_LIVE};
use super::lock::Lock;
use super::storage::{BlockId, BlockKind, Store, BLOCK_SIZE};
use super::value::Value;
use super::Database;
use crate::error::{DbError, Result};

const HEADER_MAGIC: &[u8; 4] = b"RBDB";
const HEADER_VERSION: u16 = 1;

/// File name of a table's store inside the database directory.
pub fn table_file_name(name: &str) -> String {
    format!("{name}.db")
}

/// Location of a row: the row block and the slot within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowId {
    pub block: BlockId,
    pub slot: u32,
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.slot)
    }
}

/// A named table: its schema plus fixed-length rows packed into the row
/// blocks of one [`Store`].
///
/// Scans take the row lock for read and mutations take it for write, each
/// bounded by the database lock timeout.
pub struct Table {
    schema: TableSchema,
    store: Store,
    row_lock: Lock,
    lock_timeout: Duration,
}

impl Table {
    fn new(schema: TableSchema, store: Store, lock_timeout: Duration) -> Self {
        let row_lock = Lock::new(format!("table:{}", schema.name));
        Self {
            schema,
            store,
            row_lock,
            lock_timeout,
        }
    }

    /// Reopens an existing table from `<name>.db` in the database directory.
    ///
    /// The header is decoded here; call [`Table::init`] before use to
    /// validate it.
    pub fn load_from_file(db: &Database, name: &str) -> Result<Table> {
        let path = db.path().join(table_file_name(name));
        let store = Store::open(db.block_manager().clone(), &path, name)?;
        let header = store.read_header()?;
        let schema = decode_header(name, &header)?;
        debug!(table = name, columns = schema.columns.len(), "table loaded");
        Ok(Table::new(schema, store, db.config().lock_timeout()))
    }

    /// Validates that the table is usable.
    pub fn init(&self) -> Result<()> {
        if self.store.is_closed() {
            return Err(DbError::Closed(self.schema.name.clone()));
        }
        if self.schema.name != self.store.name() {
            return Err(DbError::Corrupt(
                self.store.name().to_string(),
                format!("header names table '{}'", self.schema.name),
            ));
        }
        self.schema.validate()
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn columns(&self) -> &[Column] {
        &self.schema.columns
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Held for read by scans and for write by inserts, deletes and close.
    pub fn row_lock(&self) -> &Lock {
        &self.row_lock
    }

    fn rows_per_block(&self) -> usize {
        BLOCK_SIZE / self.schema.row_size()
    }

    /// Inserts a row and returns its location.
    pub fn insert(&self, values: &[Value]) -> Result<RowId> {
        let row = self.schema.encode_row(values)?;
        let _guard = self.row_lock.lock_write(self.lock_timeout)?;
        self.place_row(&row)
    }

    /// Inserts several rows under one hold of the row lock.
    ///
    /// Every row is encoded before the first one is written, so a value
    /// that can't be stored in its column leaves the table untouched.
    ///
    /// ## Returns
    /// The location of each row, in input order.
    pub fn insert_all(&self, rows: &[Vec<Value>]) -> Result<Vec<RowId>> {
        let encoded = rows
            .iter()
            .map(|values| self.schema.encode_row(values))
            .collect::<Result<Vec<_>>>()?;
        let _guard = self.row_lock.lock_write(self.lock_timeout)?;
        encoded.iter().map(|row| self.place_row(row)).collect()
    }

    /// Writes an encoded row into the first free slot. Caller holds the
    /// row lock for write.
    fn place_row(&self, row: &[u8]) -> Result<RowId> {
        let (block, slot) = match self.find_free_slot()? {
            Some(found) => found,
            None => (self.store.allocate(BlockKind::Row)?, 0),
        };

        let size = row.len();
        self.store.update(block, |data| {
            data[slot * size..(slot + 1) * size].copy_from_slice(row);
        })?;

        let id = RowId { block, slot: slot as u32 };
        debug!(table = %self, row = %id, "row inserted");
        Ok(id)
    }

    /// First free slot in file order, so deleted slots are reused first.
    fn find_free_slot(&self) -> Result<Option<(BlockId, usize)>> {
        let size = self.schema.row_size();
        let per_block = self.rows_per_block();
        for block in self.store.blocks(BlockKind::Row)? {
            let free = self.store.read_with(block, |data| {
                (0..per_block).find(|slot| data[slot * size] & ROW_LIVE == 0)
            })?;
            if let Some(slot) = free {
                return Ok(Some((block, slot)));
            }
        }
        Ok(None)
    }

    /// Returns every live row in storage order.
    pub fn rows(&self) -> Result<Vec<(RowId, Vec<Value>)>> {
        let _guard = self.row_lock.lock_read(self.lock_timeout)?;
        let size = self.schema.row_size();
        let per_block = self.rows_per_block();

        let mut out = Vec::new();
        let mut next = self.store.first_block(BlockId(0), BlockKind::Row)?;
        while let Some(block) = next {
            let rows = self.store.read_with(block, |data| {
                (0..per_block)
                    .filter(|slot| data[slot * size] & ROW_LIVE != 0)
                    .map(|slot| {
                        let row = self.schema.decode_row(&data[slot * size..(slot + 1) * size])?;
                        Ok((RowId { block, slot: slot as u32 }, row))
                    })
                    .collect::<Result<Vec<_>>>()
            })??;
            out.extend(rows);
            next = self.store.first_block(BlockId(block.0 + 1), BlockKind::Row)?;
        }
        Ok(out)
    }

    /// Reads one row; `None` if the slot is empty or not a row slot.
    pub fn get(&self, id: RowId) -> Result<Option<Vec<Value>>> {
        let _guard = self.row_lock.lock_read(self.lock_timeout)?;
        if !self.is_row_slot(id)? {
            return Ok(None);
        }
        let size = self.schema.row_size();
        let slot = id.slot as usize;
        self.store.read_with(id.block, |data| {
            let bytes = &data[slot * size..(slot + 1) * size];
            if bytes[0] & ROW_LIVE == 0 {
                Ok(None)
            } else {
                self.schema.decode_row(bytes).map(Some)
            }
        })?
    }

    /// Deletes one row, freeing its block once the block holds no rows.
    /// Returns false if there was no row at `id`.
    pub fn delete(&self, id: RowId) -> Result<bool> {
        let _guard = self.row_lock.lock_write(self.lock_timeout)?;
        if !self.is_row_slot(id)? {
            return Ok(false);
        }
        let size = self.schema.row_size();
        let slot = id.slot as usize;
        let per_block = self.rows_per_block();

        let (existed, now_empty) = self.store.update(id.block, |data| {
            let existed = data[slot * size] & ROW_LIVE != 0;
            data[slot * size..(slot + 1) * size].fill(0);
            let empty = (0..per_block).all(|s| data[s * size] & ROW_LIVE == 0);
            (existed, empty)
        })?;

        if now_empty {
            self.store.free(id.block)?;
        }
        if existed {
            debug!(table = %self, row = %id, "row deleted");
        }
        Ok(existed)
    }

    /// Counts live rows without decoding them.
    pub fn row_count(&self) -> Result<usize> {
        let _guard = self.row_lock.lock_read(self.lock_timeout)?;
        let size = self.schema.row_size();
        let per_block = self.rows_per_block();
        let mut count = 0;
        for block in self.store.blocks(BlockKind::Row)? {
            count += self.store.read_with(block, |data| {
                (0..per_block).filter(|s| data[s * size] & ROW_LIVE != 0).count()
            })?;
        }
        Ok(count)
    }

    fn is_row_slot(&self, id: RowId) -> Result<bool> {
        Ok((id.slot as usize) < self.rows_per_block()
            && self.store.kind(id.block)? == Some(BlockKind::Row))
    }

    /// Flushes the store and releases it, once running scans and
    /// mutations finish or the lock timeout passes.
    pub fn close(&self) -> Result<()> {
        let _guard = self.row_lock.lock_write(self.lock_timeout)?;
        self.store.close()
    }

    /// Closes the table and deletes its file.
    pub fn remove(&self) -> Result<()> {
        self.store.remove()?;
        info!(table = %self, "table removed");
        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table[{}]", self.schema.name)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("schema", &self.schema)
            .field("path", &self.store.path())
            .finish()
    }
}

fn encode_header(schema: &TableSchema) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(HEADER_MAGIC);
    out.extend_from_slice(&HEADER_VERSION.to_be_bytes());
    out.extend(bincode::serialize(schema)?);
    Ok(out)
}

fn decode_header(name: &str, header: &[u8]) -> Result<TableSchema> {
    if header.len() < 6 || &header[..4] != HEADER_MAGIC {
        return Err(DbError::Corrupt(name.to_string(), "bad header magic".to_string()));
    }
    let version = u16::from_be_bytes([header[4], header[5]]);
    if version != HEADER_VERSION {
        return Err(DbError::Corrupt(name.to_string(), format!("unsupported version {version}")));
    }
    Ok(bincode::deserialize(&header[6..])?)
}

/// Builds a new table: a name, its columns, then [`TableFactory::create`]
/// writes `<name>.db` and returns a table ready for
/// [`Database::add_table`].
pub struct TableFactory {
    dir: PathBuf,
    manager: Arc<BlockManager>,
    lock_timeout: Duration,
    schema: Option<TableSchema>,
}

impl TableFactory {
    pub(crate) fn new(dir: PathBuf, manager: Arc<BlockManager>, lock_timeout: Duration) -> Self {
        Self {
            dir,
            manager,
            lock_timeout,
            schema: None,
        }
    }

    pub fn start_table(&mut self, name: &str) -> &mut Self {
        self.schema = Some(TableSchema::new(name));
        self
    }

    pub fn add_column(&mut self, name: &str, col_type: ColumnType) -> Result<&mut Self> {
        let schema = self
            .schema
            .as_mut()
            .ok_or_else(|| DbError::Schema("add_column before start_table".to_string()))?;
        schema.columns.push(Column {
            name: name.to_string(),
            col_type,
        });
        Ok(self)
    }

    /// Creates the table file. Fails if a file for the table already exists.
    pub fn create(&mut self) -> Result<Table> {
        let schema = self
            .schema
            .take()
            .ok_or_else(|| DbError::Schema("create before start_table".to_string()))?;
        schema.validate()?;
        if !is_valid_table_name(&schema.name) {
            return Err(DbError::Schema(format!("invalid table name '{}'", schema.name)));
        }

        let path = self.dir.join(table_file_name(&schema.name));
        let store = Store::create(self.manager.clone(), &path, &schema.name)?;
        if let Err(e) = encode_header(&schema).and_then(|header| store.write_header(&header)) {
            if let Err(rm) = store.remove() {
                warn!(table = %schema.name, path = %path.display(), error = %rm,
                      "failed to remove half-created table file");
            }
            return Err(e);
        }

        info!(table = %schema.name, columns = schema.columns.len(), "table created");
        Ok(Table::new(schema, store, self.lock_timeout))
    }
}

fn is_valid_table_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;

    fn factory(dir: &tempfile::TempDir) -> TableFactory {
        TableFactory::new(dir.path().to_path_buf(), BlockManager::create(8), Duration::from_millis(100))
    }

    fn people(dir: &tempfile::TempDir) -> Table {
        let mut f = factory(dir);
        f.start_table("people");
        f.add_column("id", ColumnType::BigInt).unwrap();
        f.add_column("name", ColumnType::Varchar(32)).unwrap();
        f.create().unwrap()
    }

    #[test]
    fn insert_scan_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let table = people(&dir);
        table.init().unwrap();

        let a = table.insert(&[Value::Long(1), Value::Text("ada".into())]).unwrap();
        let b = table.insert(&[Value::Long(2), Value::Null]).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.row_count().unwrap(), 2);

        assert_eq!(
            table.get(b).unwrap(),
            Some(vec![Value::Long(2), Value::Null])
        );
        assert!(table.delete(a).unwrap());
        assert!(!table.delete(a).unwrap());
        assert_eq!(table.get(a).unwrap(), None);

        let rows = table.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, b);
    }

    #[test]
    fn rows_spill_into_new_blocks_and_slots_are_reused() {
        let dir = tempfile::tempdir().unwrap();
        let table = people(&dir);
        let per_block = BLOCK_SIZE / table.schema().row_size();

        let ids: Vec<RowId> = (0..per_block as i64 + 3)
            .map(|i| table.insert(&[Value::Long(i), Value::Null]).unwrap())
            .collect();
        assert_eq!(table.store().blocks(BlockKind::Row).unwrap().len(), 2);
        assert_eq!(table.row_count().unwrap(), per_block + 3);

        table.delete(ids[5]).unwrap();
        let reused = table.insert(&[Value::Long(-1), Value::Null]).unwrap();
        assert_eq!(reused, ids[5]);
    }

    #[test]
    fn emptied_blocks_are_freed() {
        let dir = tempfile::tempdir().unwrap();
        let table = people(&dir);
        let id = table.insert(&[Value::Long(1), Value::Null]).unwrap();
        table.delete(id).unwrap();
        assert!(table.store().blocks(BlockKind::Row).unwrap().is_empty());
        assert_eq!(table.rows().unwrap(), vec![]);
    }

    #[test]
    fn factory_rejects_bad_definitions() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = factory(&dir);
        assert!(f.add_column("x", ColumnType::Int).is_err());

        f.start_table("empty");
        assert!(matches!(f.create(), Err(DbError::Schema(_))));

        f.start_table("bad name");
        f.add_column("x", ColumnType::Int).unwrap();
        assert!(f.create().is_err());
        assert!(!dir.path().join("bad name.db").exists());
    }

    #[test]
    fn oversized_header_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = factory(&dir);
        f.start_table("wide");
        for i in 0..300 {
            f.add_column(&format!("a_rather_long_column_name_{i:04}"), ColumnType::Int).unwrap();
        }
        assert!(matches!(f.create(), Err(DbError::Schema(_))));
        assert!(!dir.path().join("wide.db").exists());
    }

    #[test]
    fn insert_all_is_rejected_whole_when_one_row_does_not_fit() {
        let dir = tempfile::tempdir().unwrap();
        let table = people(&dir);
        let rows = vec![
            vec![Value::Long(1), Value::Text("ok".into())],
            vec![Value::Text("nan".into()), Value::Null],
        ];
        assert!(table.insert_all(&rows).is_err());
        assert_eq!(table.row_count().unwrap(), 0);

        let ids = table.insert_all(&rows[..1]).unwrap();
        assert_eq!(table.get(ids[0]).unwrap(), Some(rows[0].clone()));
    }

    #[test]
    fn reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(DatabaseConfig::new(dir.path())).unwrap();
        {
            let table = people(&dir);
            table.insert(&[Value::Long(9), Value::Text("grace".into())]).unwrap();
            table.close().unwrap();
        }

        let table = Table::load_from_file(&db, "people").unwrap();
        table.init().unwrap();
        assert_eq!(table.columns().len(), 2);
        let rows = table.rows().unwrap();
        assert_eq!(rows[0].1, vec![Value::Long(9), Value::Text("grace".into())]);
    }

    #[test]
    fn corrupt_header_is_rejected() {
        assert!(matches!(decode_header("t", b"XXXX\0\x01"), Err(DbError::Corrupt(..))));
        assert!(matches!(decode_header("t", b"RBDB\0\x09"), Err(DbError::Corrupt(..))));
    }
}
