//! redb backed [`Store`].

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction, backends::InMemoryBackend};
use snafu::ResultExt;
use tracing::info;

use super::{KeySpace, ReadTx, Store, WriteTx};
use crate::{
    error::{CreateDirSnafu, Result, storage},
    keys::KeyRange,
};

mod tables;

use self::tables::table;

/// A store backed by a redb database, either on disk or in memory.
#[derive(derive_more::Debug)]
pub struct FsStore {
    #[debug("Database")]
    db: Database,
}

impl FsStore {
    /// Open or create a database file at `path`, creating parent directories as needed.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading srdi database from {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu { path })?;
        }
        let db = Database::builder().create(path).map_err(storage)?;
        Self::open(db)
    }

    /// Create a database that lives only in memory.
    pub fn in_memory() -> Result<Self> {
        info!("using in-memory srdi database");
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(storage)?;
        Self::open(db)
    }

    /// Wrap an opened database, creating any missing tables.
    pub fn open(db: Database) -> Result<Self> {
        let write_tx = db.begin_write().map_err(storage)?;
        for space in KeySpace::ALL {
            let _table = write_tx.open_table(table(space)).map_err(storage)?;
        }
        write_tx.commit().map_err(storage)?;
        Ok(Self { db })
    }
}

impl Store for FsStore {
    type Read<'a> = FsRead;
    type Write<'a> = FsWrite;

    fn begin_read(&self) -> Result<FsRead> {
        let tx = self.db.begin_read().map_err(storage)?;
        Ok(FsRead { tx })
    }

    fn begin_write(&self) -> Result<FsWrite> {
        let tx = self.db.begin_write().map_err(storage)?;
        Ok(FsWrite { tx })
    }
}

/// Read snapshot of an [`FsStore`].
#[derive(derive_more::Debug)]
pub struct FsRead {
    #[debug("ReadTransaction")]
    tx: ReadTransaction,
}

/// Write transaction of an [`FsStore`]. Aborted if dropped before commit.
#[derive(derive_more::Debug)]
pub struct FsWrite {
    #[debug("WriteTransaction")]
    tx: WriteTransaction,
}

fn get_in(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    let value = table.get(key).map_err(storage)?;
    Ok(value.map(|v| v.value().to_vec()))
}

fn range_in(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    range: &KeyRange,
    limit: Option<usize>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let iter = table.range::<&[u8]>(range.as_ref()).map_err(storage)?;
    let mut out = Vec::new();
    for item in iter.take(limit.unwrap_or(usize::MAX)) {
        let (k, v) = item.map_err(storage)?;
        out.push((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(out)
}

impl ReadTx for FsRead {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.tx.open_table(table(space)).map_err(storage)?;
        get_in(&table, key)
    }

    fn range(
        &self,
        space: KeySpace,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.tx.open_table(table(space)).map_err(storage)?;
        range_in(&table, range, limit)
    }
}

impl ReadTx for FsWrite {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let table = self.tx.open_table(table(space)).map_err(storage)?;
        get_in(&table, key)
    }

    fn range(
        &self,
        space: KeySpace,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let table = self.tx.open_table(table(space)).map_err(storage)?;
        range_in(&table, range, limit)
    }
}

impl WriteTx for FsWrite {
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        let mut table = self.tx.open_table(table(space)).map_err(storage)?;
        table.insert(key, value).map_err(storage)?;
        Ok(())
    }

    fn delete(&mut self, space: KeySpace, key: &[u8]) -> Result<bool> {
        let mut table = self.tx.open_table(table(space)).map_err(storage)?;
        let existed = table.remove(key).map_err(storage)?.is_some();
        Ok(existed)
    }

    fn commit(self) -> Result<()> {
        self.tx.commit().map_err(storage)
    }
}
