//! In memory [`Store`] without persistence.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::{KeySpace, ReadTx, Store, WriteTx};
use crate::{error::Result, keys::KeyRange};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default, Clone)]
struct Tables(BTreeMap<KeySpace, Table>);

impl Tables {
    fn get(&self, space: KeySpace, key: &[u8]) -> Option<&Vec<u8>> {
        self.0.get(&space).and_then(|t| t.get(key))
    }

    fn range<'a>(
        &'a self,
        space: KeySpace,
        range: &'a KeyRange,
    ) -> impl Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> + 'a {
        self.0
            .get(&space)
            .into_iter()
            .flat_map(move |t| t.range::<[u8], _>(range.as_ref()))
    }
}

/// A store keeping all key spaces in sorted maps.
///
/// Readers get a shared snapshot. A commit swaps in a new snapshot, copying the maps
/// only while an older snapshot is still alive.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: RwLock<Arc<Tables>>,
    writer: Mutex<()>,
}

impl MemStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<Tables> {
        self.tables.read().clone()
    }
}

impl Store for MemStore {
    type Read<'a> = MemRead;
    type Write<'a> = MemWrite<'a>;

    fn begin_read(&self) -> Result<MemRead> {
        Ok(MemRead {
            tables: self.snapshot(),
        })
    }

    fn begin_write(&self) -> Result<MemWrite<'_>> {
        let guard = self.writer.lock();
        Ok(MemWrite {
            store: self,
            _guard: guard,
            base: self.snapshot(),
            pending: Default::default(),
        })
    }
}

/// Read snapshot of a [`MemStore`].
#[derive(Debug)]
pub struct MemRead {
    tables: Arc<Tables>,
}

impl ReadTx for MemRead {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.get(space, key).cloned())
    }

    fn range(
        &self,
        space: KeySpace,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .range(space, range)
            .take(limit.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Write transaction of a [`MemStore`].
///
/// Writes are buffered, `None` marking a deletion, and applied on commit.
#[derive(derive_more::Debug)]
pub struct MemWrite<'a> {
    #[debug(skip)]
    store: &'a MemStore,
    #[debug(skip)]
    _guard: MutexGuard<'a, ()>,
    base: Arc<Tables>,
    pending: BTreeMap<KeySpace, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl ReadTx for MemWrite<'_> {
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.get(&space).and_then(|p| p.get(key)) {
            Some(value) => Ok(value.clone()),
            None => Ok(self.base.get(space, key).cloned()),
        }
    }

    fn range(
        &self,
        space: KeySpace,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<&Vec<u8>, Option<&Vec<u8>>> = self
            .base
            .range(space, range)
            .map(|(k, v)| (k, Some(v)))
            .collect();
        if let Some(pending) = self.pending.get(&space) {
            for (k, v) in pending.range::<[u8], _>(range.as_ref()) {
                merged.insert(k, v.as_ref());
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(k, v)| Some((k.clone(), v?.clone())))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }
}

impl WriteTx for MemWrite<'_> {
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()> {
        self.pending
            .entry(space)
            .or_default()
            .insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, space: KeySpace, key: &[u8]) -> Result<bool> {
        let existed = self.get(space, key)?.is_some();
        self.pending
            .entry(space)
            .or_default()
            .insert(key.to_vec(), None);
        Ok(existed)
    }

    fn commit(self) -> Result<()> {
        let MemWrite {
            store,
            _guard,
            base,
            pending,
        } = self;
        // make_mut only copies if a reader still holds the snapshot
        drop(base);
        let mut current = store.tables.write();
        let inner = Arc::make_mut(&mut *current);
        for (space, changes) in pending {
            let table = inner.0.entry(space).or_default();
            for (key, value) in changes {
                match value {
                    Some(value) => table.insert(key, value),
                    None => table.remove(&key),
                };
            }
        }
        Ok(())
    }
}
