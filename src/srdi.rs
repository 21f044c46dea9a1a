//! Shared resource distributed index: which peers claim `attribute = value`.
//!
//! Each contribution is stored under its full [`SrdiIndexKey`] in
//! [`KeySpace::SrdiEntries`], with its absolute expiration as value. Two projections
//! are kept next to it. [`KeySpace::SrdiByPeer`] finds all contributions of a peer with
//! one prefix scan and [`KeySpace::SrdiByAttribute`] finds all peers claiming one
//! `attribute = value`. [`KeySpace::SrdiExpiry`] orders contributions by expiration
//! for the sweep.

use std::{collections::BTreeSet, sync::Arc};

use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::{
    cache::NO_EXPIRATION,
    clock::Clock,
    error::{EncodeValueSnafu, MalformedKeySnafu, MalformedValueSnafu, Result},
    keys::{
        AttributeSearchKey, ExpiryKey, Key, KeyWriter, PeerSearchKey, SrdiIndexKey, ValueFilter,
    },
    store::{KeySpace, ReadTx, Store, WriteTx},
};

/// Result cap of [`SrdiIndex::query_primary`] when none is given.
pub const DEFAULT_QUERY_THRESHOLD: usize = 100;

/// A stored contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrdiEntry {
    /// Full key of the contribution.
    pub key: SrdiIndexKey,
    /// Absolute expiration in ms, or [`NO_EXPIRATION`].
    pub expires_at: i64,
}

impl SrdiEntry {
    /// Whether the contribution has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != NO_EXPIRATION && self.expires_at <= now
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<Self> {
        Ok(Self {
            key: SrdiIndexKey::decode(key).context(MalformedKeySnafu)?,
            expires_at: postcard::from_bytes(value).context(MalformedValueSnafu)?,
        })
    }

    fn expiry_key(&self) -> Option<ExpiryKey<SrdiIndexKey>> {
        (self.expires_at != NO_EXPIRATION).then(|| ExpiryKey {
            expires_at: self.expires_at,
            key: self.key.clone(),
        })
    }
}

/// The SRDI of a peer.
#[derive(Debug)]
pub struct SrdiIndex<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    default_threshold: usize,
}

impl<S: Store> SrdiIndex<S> {
    /// Create an index on top of `store`.
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            default_threshold: DEFAULT_QUERY_THRESHOLD,
        }
    }

    /// Set the result cap used when a query passes none.
    pub fn with_default_threshold(mut self, threshold: usize) -> Self {
        self.default_threshold = threshold;
        self
    }

    /// Add or refresh the contribution of `peer`.
    ///
    /// `expiration` is relative to now in ms, or [`NO_EXPIRATION`].
    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        group: &str,
        index: &str,
        primary_key: &str,
        attribute: &str,
        value: &str,
        peer: &str,
        expiration: i64,
    ) -> Result<()> {
        let key = SrdiIndexKey::full(group, index, primary_key, attribute, value, peer);
        self.put_key(&key, expiration)
    }

    /// Add or refresh a contribution given as a prebuilt key.
    ///
    /// Keys that are not complete are rejected before anything is written.
    pub fn put_key(&self, key: &SrdiIndexKey, expiration: i64) -> Result<()> {
        let by_peer = key.peer_key()?;
        let by_attribute = key.attribute_key()?;
        let expires_at = match expiration {
            NO_EXPIRATION => NO_EXPIRATION,
            expiration => self.clock.now_ms().saturating_add(expiration),
        };
        let entry = SrdiEntry {
            key: key.clone(),
            expires_at,
        };
        let encoded = key.encode();
        let value = postcard::to_stdvec(&expires_at).context(EncodeValueSnafu)?;

        let mut tx = self.store.begin_write()?;
        if let Some(old) = tx.get(KeySpace::SrdiEntries, &encoded)? {
            let old = SrdiEntry::decode(&encoded, &old)?;
            if let Some(expiry) = old.expiry_key() {
                tx.delete(KeySpace::SrdiExpiry, &expiry.encode())?;
            }
        }
        tx.put(KeySpace::SrdiEntries, &encoded, &value)?;
        tx.put(KeySpace::SrdiByPeer, &by_peer.encode(), &[])?;
        tx.put(KeySpace::SrdiByAttribute, &by_attribute.encode(), &[])?;
        if let Some(expiry) = entry.expiry_key() {
            tx.put(KeySpace::SrdiExpiry, &expiry.encode(), &[])?;
        }
        tx.commit()?;
        trace!(?key, expires_at, "stored srdi entry");
        Ok(())
    }

    /// Peers that contributed `attribute = value` to an index, for any primary key.
    ///
    /// Only the contributions of that `attribute = value` are visited.
    pub fn query(
        &self,
        group: &str,
        index: &str,
        attribute: &str,
        value: &str,
    ) -> Result<BTreeSet<String>> {
        let now = self.clock.now_ms();
        let tx = self.store.begin_read()?;
        let range = AttributeSearchKey::value_range(group, index, attribute, value);
        let mut peers = BTreeSet::new();
        for k in tx.keys(KeySpace::SrdiByAttribute, &range)? {
            let by_attribute = AttributeSearchKey::decode(&k).context(MalformedKeySnafu)?;
            if peers.contains(&by_attribute.peer) {
                continue;
            }
            let encoded = by_attribute.index_key().encode();
            let Some(v) = tx.get(KeySpace::SrdiEntries, &encoded)? else {
                continue;
            };
            if !SrdiEntry::decode(&encoded, &v)?.is_expired(now) {
                peers.insert(by_attribute.peer);
            }
        }
        Ok(peers)
    }

    /// Peers that contributed a matching value for `attribute` of `primary_key`.
    ///
    /// At most `threshold` peers are returned, or the default threshold if `None`.
    pub fn query_primary(
        &self,
        group: &str,
        index: &str,
        primary_key: &str,
        attribute: &str,
        filter: &ValueFilter,
        threshold: Option<usize>,
    ) -> Result<BTreeSet<String>> {
        let limit = threshold.unwrap_or(self.default_threshold);
        let now = self.clock.now_ms();
        let mut w = KeyWriter::new();
        w.push_str(group)
            .push_str(index)
            .push_str(primary_key)
            .push_str(attribute);
        filter.write_prefix(&mut w);
        let range = w.into_range();

        let tx = self.store.begin_read()?;
        let mut peers = BTreeSet::new();
        for (k, v) in tx.range(KeySpace::SrdiEntries, &range, None)? {
            if peers.len() >= limit {
                break;
            }
            let entry = SrdiEntry::decode(&k, &v)?;
            let matches = entry.key.attr_value().is_some_and(|v| filter.matches(v));
            if matches && !entry.is_expired(now) {
                if let Some(peer) = entry.key.peer() {
                    peers.insert(peer.to_string());
                }
            }
        }
        Ok(peers)
    }

    /// Live contributions for one `(primary key, attribute, value)`, one per peer.
    pub fn records(
        &self,
        group: &str,
        index: &str,
        primary_key: &str,
        attribute: &str,
        value: &str,
    ) -> Result<Vec<SrdiEntry>> {
        let now = self.clock.now_ms();
        let tx = self.store.begin_read()?;
        let range = SrdiIndexKey::value(group, index, primary_key, attribute, value).prefix_range();
        let mut out = Vec::new();
        for (k, v) in tx.range(KeySpace::SrdiEntries, &range, None)? {
            let entry = SrdiEntry::decode(&k, &v)?;
            if !entry.is_expired(now) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Remove every contribution of `peer` to an index in one transaction.
    ///
    /// Returns the number of removed contributions.
    pub fn remove_all_for_peer(&self, group: &str, index: &str, peer: &str) -> Result<usize> {
        let mut tx = self.store.begin_write()?;
        let range = PeerSearchKey::peer_range(group, index, peer);
        let mut removed = 0;
        for k in tx.keys(KeySpace::SrdiByPeer, &range)? {
            let by_peer = PeerSearchKey::decode(&k).context(MalformedKeySnafu)?;
            if remove_entry_in(&mut tx, &by_peer.index_key())? {
                removed += 1;
            }
        }
        tx.commit()?;
        debug!(%group, %index, %peer, removed, "removed srdi entries of peer");
        Ok(removed)
    }

    /// Remove one contribution. Returns whether it existed.
    pub fn remove_entry(&self, key: &SrdiIndexKey) -> Result<bool> {
        key.peer_key()?;
        let mut tx = self.store.begin_write()?;
        let removed = remove_entry_in(&mut tx, key)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Remove every contribution below a key prefix in one transaction.
    pub fn remove_prefix(&self, prefix: &SrdiIndexKey) -> Result<usize> {
        let mut tx = self.store.begin_write()?;
        let mut removed = 0;
        for k in tx.keys(KeySpace::SrdiEntries, &prefix.prefix_range())? {
            let key = SrdiIndexKey::decode(&k).context(MalformedKeySnafu)?;
            if remove_entry_in(&mut tx, &key)? {
                removed += 1;
            }
        }
        tx.commit()?;
        debug!(?prefix, removed, "removed srdi entries");
        Ok(removed)
    }

    /// Remove a whole index of a group.
    pub fn clear(&self, group: &str, index: &str) -> Result<usize> {
        self.remove_prefix(&SrdiIndexKey::index(group, index))
    }

    /// Remove every contribution that expired at or before `now`.
    ///
    /// Each contribution is removed in its own transaction. Failures are logged and
    /// retried on the next sweep.
    pub fn remove_expired(&self, now: i64) -> Result<usize> {
        let due = {
            let tx = self.store.begin_read()?;
            let range = ExpiryKey::<SrdiIndexKey>::due_range(now);
            tx.keys(KeySpace::SrdiExpiry, &range)?
        };
        let mut removed = 0;
        for raw in &due {
            match self.expire_one(raw, now) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!("failed to evict expired srdi entry: {err:#}"),
            }
        }
        debug!(due = due.len(), removed, "swept srdi index");
        Ok(removed)
    }

    fn expire_one(&self, raw: &[u8], now: i64) -> Result<bool> {
        let expiry = ExpiryKey::<SrdiIndexKey>::decode(raw).context(MalformedKeySnafu)?;
        let encoded = expiry.key.encode();
        let mut tx = self.store.begin_write()?;
        let expired = match tx.get(KeySpace::SrdiEntries, &encoded)? {
            Some(value) => SrdiEntry::decode(&encoded, &value)?.is_expired(now),
            None => false,
        };
        let removed = match expired {
            true => remove_entry_in(&mut tx, &expiry.key)?,
            false => false,
        };
        tx.delete(KeySpace::SrdiExpiry, raw)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Sweep everything due according to the index's clock.
    pub fn garbage_collect(&self) -> Result<usize> {
        self.remove_expired(self.clock.now_ms())
    }
}

fn remove_entry_in(tx: &mut impl WriteTx, key: &SrdiIndexKey) -> Result<bool> {
    let encoded = key.encode();
    let Some(value) = tx.get(KeySpace::SrdiEntries, &encoded)? else {
        return Ok(false);
    };
    let entry = SrdiEntry::decode(&encoded, &value)?;
    if let Some(expiry) = entry.expiry_key() {
        tx.delete(KeySpace::SrdiExpiry, &expiry.encode())?;
    }
    tx.delete(KeySpace::SrdiByPeer, &key.peer_key()?.encode())?;
    tx.delete(KeySpace::SrdiByAttribute, &key.attribute_key()?.encode())?;
    tx.delete(KeySpace::SrdiEntries, &encoded)?;
    Ok(true)
}


#[cfg(test)]
mod tests {
    use std::thread;

    use testresult::TestResult;

    use super::*;
    use crate::{
        Error,
        clock::ManualClock,
        keys::KeyRange,
        store::{fs::FsStore, memory::MemStore},
    };

    fn index_on<S: Store>(store: S) -> (SrdiIndex<S>, ManualClock) {
        let clock = ManualClock::new(0);
        (SrdiIndex::new(Arc::new(store), Arc::new(clock.clone())), clock)
    }

    fn index() -> (SrdiIndex<MemStore>, ManualClock) {
        index_on(MemStore::new())
    }

    fn peers(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|p| p.to_string()).collect()
    }

    fn count(srdi: &SrdiIndex<impl Store>, space: KeySpace) -> TestResult<usize> {
        let tx = srdi.store.begin_read()?;
        Ok(tx.keys(space, &KeyRange::all())?.len())
    }

    /// Number of stored entries, checking that both projections hold one row per entry.
    fn consistent_entries(srdi: &SrdiIndex<impl Store>) -> TestResult<usize> {
        let entries = count(srdi, KeySpace::SrdiEntries)?;
        assert_eq!(count(srdi, KeySpace::SrdiByPeer)?, entries);
        assert_eq!(count(srdi, KeySpace::SrdiByAttribute)?, entries);
        Ok(entries)
    }

    #[test]
    fn put_and_query() -> TestResult {
        let (srdi, _) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "pk2", "Name", "alice", "peer2", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "pk3", "Name", "bob", "peer3", NO_EXPIRATION)?;
        srdi.put("g", "Groups", "p4", "Name", "alice", "peer4", NO_EXPIRATION)?;
        srdi.put("h", "Peers", "pk5", "Name", "alice", "peer5", NO_EXPIRATION)?;

        let found = srdi.query("g", "Peers", "Name", "alice")?;
        assert_eq!(found, peers(&["peer1", "peer2"]));
        let found = srdi.query("g", "Peers", "Name", "bob")?;
        assert_eq!(found, peers(&["peer3"]));
        assert!(srdi.query("g", "Peers", "Other", "alice")?.is_empty());
        assert_eq!(consistent_entries(&srdi)?, 5);
        Ok(())
    }

    #[test]
    fn query_matches_attribute_and_value_exactly() -> TestResult {
        let (srdi, _) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "pk2", "Name", "alice", "peer1", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "pk1", "Name", "alic", "peer2", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "pk1", "PID", "alice", "peer3", NO_EXPIRATION)?;
        assert_eq!(consistent_entries(&srdi)?, 4);

        let found = srdi.query("g", "Peers", "Name", "alice")?;
        assert_eq!(found, peers(&["peer1"]));
        let found = srdi.query("g", "Peers", "Name", "alic")?;
        assert_eq!(found, peers(&["peer2"]));
        let found = srdi.query("g", "Peers", "PID", "alice")?;
        assert_eq!(found, peers(&["peer3"]));

        // an entry without its by-attribute row is invisible to queries
        let key = SrdiIndexKey::full("g", "Peers", "pk1", "Name", "alic", "peer2");
        let mut tx = srdi.store.begin_write()?;
        tx.delete(KeySpace::SrdiByAttribute, &key.attribute_key()?.encode())?;
        tx.commit()?;
        assert!(srdi.query("g", "Peers", "Name", "alic")?.is_empty());
        assert_eq!(srdi.records("g", "Peers", "pk1", "Name", "alic")?.len(), 1);
        Ok(())
    }

    #[test]
    fn incomplete_keys_are_rejected() -> TestResult {
        let (srdi, _) = index();
        let key = SrdiIndexKey::index("g", "Peers");
        let err = srdi.put_key(&key, 1_000).unwrap_err();
        assert!(matches!(err, Error::StructuralViolation { .. }));
        assert!(matches!(
            srdi.remove_entry(&SrdiIndexKey::group("g")),
            Err(Error::StructuralViolation { .. })
        ));
        for space in KeySpace::ALL {
            assert_eq!(count(&srdi, space)?, 0);
        }
        Ok(())
    }

    #[test]
    fn remove_all_for_peer_is_exact() -> TestResult {
        let (srdi, _) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", 1_000)?;
        srdi.put("g", "Peers", "pk1", "PID", "x", "peer1", NO_EXPIRATION)?;
        srdi.put("g", "Peers", "p1", "Name", "alice", "peer10", NO_EXPIRATION)?;
        srdi.put("g", "Groups", "p2", "Name", "alice", "peer1", NO_EXPIRATION)?;

        assert_eq!(srdi.remove_all_for_peer("g", "Peers", "peer1")?, 2);
        let found = srdi.query("g", "Peers", "Name", "alice")?;
        assert_eq!(found, peers(&["peer10"]));
        let found = srdi.query("g", "Groups", "Name", "alice")?;
        assert_eq!(found, peers(&["peer1"]));
        assert_eq!(consistent_entries(&srdi)?, 2);
        assert_eq!(count(&srdi, KeySpace::SrdiExpiry)?, 0);
        assert_eq!(srdi.remove_all_for_peer("g", "Peers", "peer1")?, 0);
        Ok(())
    }

    #[test]
    fn expired_entries_are_hidden_then_swept() -> TestResult {
        let (srdi, clock) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", 1_000)?;
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer2", 5_000)?;
        clock.set(1_000);
        let found = srdi.query("g", "Peers", "Name", "alice")?;
        assert_eq!(found, peers(&["peer2"]));

        assert_eq!(srdi.garbage_collect()?, 1);
        assert_eq!(srdi.garbage_collect()?, 0);
        assert_eq!(consistent_entries(&srdi)?, 1);
        assert_eq!(count(&srdi, KeySpace::SrdiExpiry)?, 1);
        Ok(())
    }

    #[test]
    fn refresh_replaces_expiry() -> TestResult {
        let (srdi, clock) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", 1_000)?;
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", 10_000)?;
        assert_eq!(count(&srdi, KeySpace::SrdiExpiry)?, 1);
        assert_eq!(consistent_entries(&srdi)?, 1);
        clock.set(2_000);
        assert_eq!(srdi.remove_expired(2_000)?, 0);
        let records = srdi.records("g", "Peers", "pk1", "Name", "alice")?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].expires_at, 10_000);
        assert_eq!(records[0].key.peer(), Some("peer1"));
        Ok(())
    }

    #[test]
    fn query_primary_filters_and_caps() -> TestResult {
        let (srdi, _) = index();
        let srdi = srdi.with_default_threshold(2);
        let contributions = [
            ("alice", "p1"),
            ("alan", "p2"),
            ("bob", "p3"),
            ("alfred", "p4"),
        ];
        for (value, peer) in contributions {
            srdi.put("g", "Peers", "pk", "Name", value, peer, NO_EXPIRATION)?;
        }
        srdi.put("g", "Peers", "other", "Name", "alice", "p5", NO_EXPIRATION)?;

        let prefix = ValueFilter::from_wildcard("al*");
        let found = srdi.query_primary("g", "Peers", "pk", "Name", &prefix, Some(10))?;
        assert_eq!(found, peers(&["p1", "p2", "p4"]));
        let capped = srdi.query_primary("g", "Peers", "pk", "Name", &prefix, None)?;
        assert_eq!(capped.len(), 2);
        let exact = ValueFilter::from("bob");
        let found = srdi.query_primary("g", "Peers", "pk", "Name", &exact, None)?;
        assert_eq!(found, peers(&["p3"]));
        let contains = ValueFilter::from_wildcard("*e*");
        let found = srdi.query_primary("g", "Peers", "pk", "Name", &contains, Some(10))?;
        assert_eq!(found, peers(&["p1", "p4"]));
        Ok(())
    }

    #[test]
    fn clear_and_remove_entry() -> TestResult {
        let (srdi, _) = index();
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", 1_000)?;
        srdi.put("g", "Peers", "pk2", "Name", "bob", "peer2", NO_EXPIRATION)?;
        srdi.put("g", "Groups", "p3", "Name", "carol", "peer3", NO_EXPIRATION)?;

        let key = SrdiIndexKey::full("g", "Peers", "pk2", "Name", "bob", "peer2");
        assert!(srdi.remove_entry(&key)?);
        assert!(!srdi.remove_entry(&key)?);
        assert!(srdi.query("g", "Peers", "Name", "bob")?.is_empty());

        assert_eq!(srdi.clear("g", "Peers")?, 1);
        assert_eq!(consistent_entries(&srdi)?, 1);
        assert_eq!(count(&srdi, KeySpace::SrdiExpiry)?, 0);
        assert_eq!(srdi.remove_prefix(&SrdiIndexKey::group("g"))?, 1);
        assert_eq!(consistent_entries(&srdi)?, 0);
        Ok(())
    }

    #[test]
    fn concurrent_put_and_remove_stay_consistent() -> TestResult {
        let (srdi, _) = index();
        let srdi = Arc::new(srdi);
        let writer = {
            let srdi = srdi.clone();
            thread::spawn(move || -> Result<()> {
                for i in 0..200 {
                    srdi.put("g", "Peers", &format!("pk{i}"), "Name", "v", "peer1", 1_000)?;
                }
                Ok(())
            })
        };
        for _ in 0..20 {
            srdi.remove_all_for_peer("g", "Peers", "peer1")?;
        }
        writer.join().map_err(|_| "writer panicked")??;
        let entries = consistent_entries(&srdi)?;
        assert_eq!(count(&srdi, KeySpace::SrdiExpiry)?, entries);
        Ok(())
    }

    #[test]
    fn fs_store_roundtrip() -> TestResult {
        let (srdi, _) = index_on(FsStore::in_memory()?);
        srdi.put("g", "Peers", "pk1", "Name", "alice", "peer1", NO_EXPIRATION)?;
        let found = srdi.query("g", "Peers", "Name", "alice")?;
        assert_eq!(found, peers(&["peer1"]));
        assert_eq!(srdi.remove_all_for_peer("g", "Peers", "peer1")?, 1);
        assert!(srdi.query("g", "Peers", "Name", "alice")?.is_empty());
        assert_eq!(consistent_entries(&srdi)?, 0);
        Ok(())
    }
}
