//! Ordered key-value storage with atomic multi-key transactions.
//!
//! The cache and the SRDI index only need a handful of sorted byte maps. Each map is a
//! [`KeySpace`]. A [`Store`] hands out read snapshots and exclusive write transactions
//! spanning all key spaces; changes in a write transaction become visible together on
//! [`WriteTx::commit`] and are discarded when the transaction is dropped uncommitted.

use std::fmt::Debug;

use derive_more::Display;

use crate::{error::Result, keys::KeyRange};

pub mod fs;
pub mod memory;

/// The separate sorted maps kept by a store.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeySpace {
    /// Advertisement records by [`crate::keys::RecordKey`].
    #[display("records")]
    Records,
    /// Advertisement search keys, [`crate::keys::AdvSearchKey`]. Values are empty.
    #[display("adv-index")]
    AdvIndex,
    /// Advertisement expiry keys, [`crate::keys::ExpiryKey`] over record keys.
    #[display("adv-expiry")]
    AdvExpiry,
    /// SRDI entries by [`crate::keys::SrdiIndexKey`].
    #[display("srdi-entries")]
    SrdiEntries,
    /// SRDI by-peer projections, [`crate::keys::PeerSearchKey`]. Values are empty.
    #[display("srdi-by-peer")]
    SrdiByPeer,
    /// SRDI by-attribute projections, [`crate::keys::AttributeSearchKey`]. Values are empty.
    #[display("srdi-by-attribute")]
    SrdiByAttribute,
    /// SRDI expiry keys, [`crate::keys::ExpiryKey`] over SRDI keys.
    #[display("srdi-expiry")]
    SrdiExpiry,
}

impl KeySpace {
    /// Every key space, in declaration order.
    pub const ALL: [KeySpace; 7] = [
        KeySpace::Records,
        KeySpace::AdvIndex,
        KeySpace::AdvExpiry,
        KeySpace::SrdiEntries,
        KeySpace::SrdiByPeer,
        KeySpace::SrdiByAttribute,
        KeySpace::SrdiExpiry,
    ];
}

/// Read access to a consistent snapshot of all key spaces.
pub trait ReadTx {
    /// Get the value stored at `key`.
    fn get(&self, space: KeySpace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All entries inside `range` in ascending key order, at most `limit` of them.
    fn range(
        &self,
        space: KeySpace,
        range: &KeyRange,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// The keys inside `range` in ascending order.
    fn keys(&self, space: KeySpace, range: &KeyRange) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .range(space, range, None)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    /// Whether `key` is present.
    fn contains(&self, space: KeySpace, key: &[u8]) -> Result<bool> {
        Ok(self.get(space, key)?.is_some())
    }
}

/// An exclusive write transaction. Reads observe the transaction's own writes.
pub trait WriteTx: ReadTx {
    /// Insert or replace the value at `key`.
    fn put(&mut self, space: KeySpace, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`, returning whether it was present.
    fn delete(&mut self, space: KeySpace, key: &[u8]) -> Result<bool>;

    /// Make all writes visible atomically.
    fn commit(self) -> Result<()>;
}

/// A store of sorted byte maps.
pub trait Store: Debug + Send + Sync + 'static {
    /// Read snapshot type.
    type Read<'a>: ReadTx
    where
        Self: 'a;

    /// Write transaction type.
    type Write<'a>: WriteTx
    where
        Self: 'a;

    /// Open a read snapshot.
    fn begin_read(&self) -> Result<Self::Read<'_>>;

    /// Open a write transaction. Blocks while another write transaction is open.
    fn begin_write(&self) -> Result<Self::Write<'_>>;
}
