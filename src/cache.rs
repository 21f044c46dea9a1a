//! Advertisement cache with secondary and expiry indices.
//!
//! Records live in [`KeySpace::Records`] under `(area, directory, file)`. Every
//! advertisement additionally owns one search key per index field in
//! [`KeySpace::AdvIndex`] and, unless it never expires, one key in
//! [`KeySpace::AdvExpiry`]. A record and all of its keys are always written and
//! removed in the same transaction.
//!
//! The stored record keeps the fields it was indexed with, so the previous key set can
//! be removed on overwrite without parsing the old document again.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::{
    clock::Clock,
    delta::{DeltaEntry, DeltaTracker},
    error::{EncodeValueSnafu, MalformedKeySnafu, MalformedValueSnafu, Result},
    keys::{AdvSearchKey, ExpiryKey, Key, RecordKey, ValueFilter},
    registry::{DocumentRegistry, IndexField},
    store::{KeySpace, ReadTx, Store, WriteTx},
};

/// Lifetime sentinel for records that never become stale.
pub const INFINITE: i64 = i64::MAX;
/// Expiration sentinel for records that are never deleted by the sweep.
pub const NO_EXPIRATION: i64 = i64::MAX;

/// A cached record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    /// Directory the record lives in.
    pub directory: String,
    /// File name inside the directory.
    pub file: String,
    /// Whether `data` is an advertisement document rather than an opaque blob.
    pub is_advertisement: bool,
    /// Raw record bytes.
    pub data: Bytes,
    /// Instant the record was written, in ms.
    pub created_at: i64,
    /// Relative lifetime in ms, or [`INFINITE`].
    pub lifetime: i64,
    /// Relative expiration in ms, or [`NO_EXPIRATION`].
    pub expiration: i64,
    /// Index fields the record was indexed with.
    pub fields: Vec<IndexField>,
}

impl AdvertisementRecord {
    /// Absolute instant the lifetime ends, `None` if infinite.
    pub fn lifetime_at(&self) -> Option<i64> {
        (self.lifetime != INFINITE).then(|| self.created_at.saturating_add(self.lifetime))
    }

    /// Absolute instant the record expires, `None` if it never does.
    pub fn expires_at(&self) -> Option<i64> {
        (self.expiration != NO_EXPIRATION).then(|| self.created_at.saturating_add(self.expiration))
    }

    /// Whether the record has expired at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    fn from_stored(key: &RecordKey, value: &[u8]) -> Result<Self> {
        let stored: StoredRecord = postcard::from_bytes(value).context(MalformedValueSnafu)?;
        Ok(Self {
            directory: key.directory.clone(),
            file: key.file.clone(),
            is_advertisement: stored.is_advertisement,
            data: stored.data,
            created_at: stored.created_at,
            lifetime: stored.lifetime,
            expiration: stored.expiration,
            fields: stored.fields,
        })
    }

    fn to_stored(&self) -> Result<Vec<u8>> {
        let stored = StoredRecord {
            is_advertisement: self.is_advertisement,
            data: self.data.clone(),
            created_at: self.created_at,
            lifetime: self.lifetime,
            expiration: self.expiration,
            fields: self.fields.clone(),
        };
        postcard::to_stdvec(&stored).context(EncodeValueSnafu)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    is_advertisement: bool,
    data: Bytes,
    created_at: i64,
    lifetime: i64,
    expiration: i64,
    fields: Vec<IndexField>,
}

/// The advertisement cache of one area.
#[derive(Debug)]
pub struct AdvertisementCache<S> {
    area: String,
    store: Arc<S>,
    registry: Arc<dyn DocumentRegistry>,
    clock: Arc<dyn Clock>,
    deltas: DeltaTracker,
}

impl<S: Store> AdvertisementCache<S> {
    /// Create a cache for `area` on top of `store`.
    pub fn new(
        area: impl Into<String>,
        store: Arc<S>,
        registry: Arc<dyn DocumentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let deltas = DeltaTracker::new(registry.clone());
        Self {
            area: area.into(),
            store,
            registry,
            clock,
            deltas,
        }
    }

    /// The area this cache writes to.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// The delta tracker fed by [`Self::put`].
    pub fn deltas(&self) -> &DeltaTracker {
        &self.deltas
    }

    /// Store a record, replacing any previous record at the same key.
    ///
    /// The record, its search keys and its expiry key are written atomically. The
    /// previous version's keys are removed in the same transaction. If the document
    /// cannot be parsed the record is stored without search keys.
    pub fn put(
        &self,
        directory: &str,
        file: &str,
        data: impl Into<Bytes>,
        is_advertisement: bool,
        lifetime: i64,
        expiration: i64,
    ) -> Result<()> {
        let data = data.into();
        let fields = match is_advertisement {
            true => self.resolve_fields(directory, file, &data),
            false => Vec::new(),
        };
        let record = AdvertisementRecord {
            directory: directory.to_string(),
            file: file.to_string(),
            is_advertisement,
            data,
            created_at: self.clock.now_ms(),
            lifetime,
            expiration,
            fields,
        };
        let key = self.record_key(directory, file);
        let value = record.to_stored()?;

        let mut tx = self.store.begin_write()?;
        remove_in(&mut tx, &key)?;
        tx.put(KeySpace::Records, &key.encode(), &value)?;
        for search_key in search_keys(&key, &record.fields) {
            tx.put(KeySpace::AdvIndex, &search_key.encode(), &[])?;
        }
        if let Some(expiry) = expiry_key(&key, &record) {
            tx.put(KeySpace::AdvExpiry, &expiry.encode(), &[])?;
        }
        tx.commit()?;
        trace!(area = %self.area, %directory, %file, fields = record.fields.len(), "stored record");

        self.deltas
            .record_fields(directory, &record.fields, expiration);
        Ok(())
    }

    /// Store a record that never becomes stale and never expires.
    pub fn put_default(
        &self,
        directory: &str,
        file: &str,
        data: impl Into<Bytes>,
        is_advertisement: bool,
    ) -> Result<()> {
        self.put(
            directory,
            file,
            data,
            is_advertisement,
            INFINITE,
            NO_EXPIRATION,
        )
    }

    /// Get a record. Expired records are absent even before they are swept.
    pub fn get(&self, directory: &str, file: &str) -> Result<Option<AdvertisementRecord>> {
        let tx = self.store.begin_read()?;
        live_record(&tx, &self.record_key(directory, file), self.clock.now_ms())
    }

    /// Records of a directory in file order, at most `threshold` of them if it is
    /// positive.
    ///
    /// Also returns the absolute expiration of every record, in the same order, with
    /// [`NO_EXPIRATION`] for records that never expire. Without `include_data` the
    /// returned records carry empty data.
    pub fn get_records(
        &self,
        directory: &str,
        threshold: i64,
        include_data: bool,
    ) -> Result<(Vec<AdvertisementRecord>, Vec<i64>)> {
        let limit = usize::try_from(threshold).ok().filter(|l| *l > 0);
        let now = self.clock.now_ms();
        let tx = self.store.begin_read()?;
        let range = RecordKey::directory_range(&self.area, directory);
        let mut records = Vec::new();
        let mut expirations = Vec::new();
        for (k, v) in tx.range(KeySpace::Records, &range, None)? {
            if limit.is_some_and(|l| records.len() >= l) {
                break;
            }
            let key = RecordKey::decode(&k).context(MalformedKeySnafu)?;
            let mut record = AdvertisementRecord::from_stored(&key, &v)?;
            if record.is_expired(now) {
                continue;
            }
            if !include_data {
                record.data = Bytes::new();
            }
            expirations.push(record.expires_at().unwrap_or(NO_EXPIRATION));
            records.push(record);
        }
        Ok((records, expirations))
    }

    /// Remove a record and all its keys. Returns whether it existed.
    pub fn remove(&self, directory: &str, file: &str) -> Result<bool> {
        let key = self.record_key(directory, file);
        let mut tx = self.store.begin_write()?;
        let existed = remove_in(&mut tx, &key)?;
        tx.commit()?;
        trace!(area = %self.area, %directory, %file, existed, "removed record");
        Ok(existed)
    }

    /// The search keys a record is indexed under, derived from its current data.
    ///
    /// Opaque records and unparsable documents have none.
    pub fn derive_keys(&self, record: &AdvertisementRecord) -> BTreeSet<AdvSearchKey> {
        if !record.is_advertisement {
            return BTreeSet::new();
        }
        let fields = self.resolve_fields(&record.directory, &record.file, &record.data);
        let key = self.record_key(&record.directory, &record.file);
        search_keys(&key, &fields).collect()
    }

    /// The expiry key of a record, `None` if it never expires.
    pub fn expiry_key_for(&self, record: &AdvertisementRecord) -> Option<ExpiryKey<RecordKey>> {
        expiry_key(&self.record_key(&record.directory, &record.file), record)
    }

    /// Files in `area`/`directory` whose `field` equals `value`.
    pub fn find_by_field(
        &self,
        area: &str,
        directory: &str,
        field: &str,
        value: &str,
    ) -> Result<BTreeSet<String>> {
        let filter = ValueFilter::Exact(value.to_string());
        let found = self.lookup(area, directory, field, &filter, None)?;
        Ok(found.into_iter().map(|r| r.file).collect())
    }

    /// Records in this cache's area whose `field` matches `filter`, ordered by value.
    ///
    /// At most `threshold` records are returned if it is positive.
    pub fn find(
        &self,
        directory: &str,
        field: &str,
        filter: &ValueFilter,
        threshold: i64,
    ) -> Result<Vec<AdvertisementRecord>> {
        let limit = usize::try_from(threshold).ok().filter(|l| *l > 0);
        self.lookup(&self.area, directory, field, filter, limit)
    }

    fn lookup(
        &self,
        area: &str,
        directory: &str,
        field: &str,
        filter: &ValueFilter,
        limit: Option<usize>,
    ) -> Result<Vec<AdvertisementRecord>> {
        let now = self.clock.now_ms();
        let tx = self.store.begin_read()?;
        let range = AdvSearchKey::field_range(area, directory, field, filter);
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for k in tx.keys(KeySpace::AdvIndex, &range)? {
            if limit.is_some_and(|l| out.len() >= l) {
                break;
            }
            let search_key = AdvSearchKey::decode(&k).context(MalformedKeySnafu)?;
            if !filter.matches(&search_key.value) || seen.contains(&search_key.file) {
                continue;
            }
            if let Some(record) = live_record(&tx, &search_key.record_key(), now)? {
                seen.insert(search_key.file);
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Remaining expiration of a live record in ms, [`NO_EXPIRATION`] if it never expires.
    pub fn expiration_of(&self, directory: &str, file: &str) -> Result<Option<i64>> {
        let now = self.clock.now_ms();
        Ok(self.get(directory, file)?.map(|r| match r.expires_at() {
            Some(at) => at - now,
            None => NO_EXPIRATION,
        }))
    }

    /// Remaining lifetime of a live record in ms, [`INFINITE`] if it never becomes stale.
    ///
    /// `None` if the record is absent or its lifetime has passed.
    pub fn lifetime_of(&self, directory: &str, file: &str) -> Result<Option<i64>> {
        let now = self.clock.now_ms();
        Ok(self
            .get(directory, file)?
            .and_then(|r| match r.lifetime_at() {
                Some(at) => (at > now).then(|| at - now),
                None => Some(INFINITE),
            }))
    }

    /// Every index field of the live records in a directory, with the remaining
    /// expiration of its record.
    ///
    /// Used to send a complete index to a new replica. With `clear_deltas` the pending
    /// deltas of the directory are discarded, since the entries supersede them.
    pub fn entries(&self, directory: &str, clear_deltas: bool) -> Result<Vec<DeltaEntry>> {
        let now = self.clock.now_ms();
        let tx = self.store.begin_read()?;
        let range = AdvSearchKey::directory_range(&self.area, directory);
        let mut records: HashMap<String, Option<AdvertisementRecord>> = HashMap::new();
        let mut out = Vec::new();
        for k in tx.keys(KeySpace::AdvIndex, &range)? {
            let search_key = AdvSearchKey::decode(&k).context(MalformedKeySnafu)?;
            if !records.contains_key(&search_key.file) {
                let record = live_record(&tx, &search_key.record_key(), now)?;
                records.insert(search_key.file.clone(), record);
            }
            let Some(Some(record)) = records.get(&search_key.file) else {
                continue;
            };
            let expiry = match record.expires_at() {
                Some(at) => at - now,
                None => NO_EXPIRATION,
            };
            out.push(DeltaEntry {
                field: search_key.field,
                value: search_key.value,
                expiry,
            });
        }
        if clear_deltas {
            self.deltas.clear(directory);
        }
        Ok(out)
    }

    /// Keys of all records, in any area, whose expiry is at or before `now`.
    pub fn due_as_of(&self, now: i64) -> Result<Vec<RecordKey>> {
        let tx = self.store.begin_read()?;
        let range = ExpiryKey::<RecordKey>::due_range(now);
        tx.keys(KeySpace::AdvExpiry, &range)?
            .iter()
            .map(|k| {
                ExpiryKey::<RecordKey>::decode(k)
                    .map(|e| e.key)
                    .context(MalformedKeySnafu)
            })
            .collect()
    }

    /// Remove every record due at `now` together with its keys.
    ///
    /// Each record is removed in its own transaction. Failures are logged and the
    /// key is retried on the next sweep. Returns the number of removed records.
    pub fn sweep(&self, now: i64) -> Result<usize> {
        let due = {
            let tx = self.store.begin_read()?;
            let range = ExpiryKey::<RecordKey>::due_range(now);
            tx.keys(KeySpace::AdvExpiry, &range)?
        };
        let mut removed = 0;
        for raw in &due {
            match self.sweep_one(raw, now) {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(err) => warn!("failed to evict expired record: {err:#}"),
            }
        }
        debug!(due = due.len(), removed, "swept advertisement cache");
        Ok(removed)
    }

    fn sweep_one(&self, raw: &[u8], now: i64) -> Result<bool> {
        let expiry = ExpiryKey::<RecordKey>::decode(raw).context(MalformedKeySnafu)?;
        let mut tx = self.store.begin_write()?;
        let current = match tx.get(KeySpace::Records, &expiry.key.encode())? {
            Some(value) => Some(AdvertisementRecord::from_stored(&expiry.key, &value)?),
            None => None,
        };
        let removed = match current {
            Some(record) if record.is_expired(now) => remove_in(&mut tx, &expiry.key)?,
            _ => false,
        };
        // an expiry key without a matching record is dropped
        tx.delete(KeySpace::AdvExpiry, raw)?;
        tx.commit()?;
        Ok(removed)
    }

    /// Sweep everything due according to the cache's clock.
    pub fn garbage_collect(&self) -> Result<usize> {
        self.sweep(self.clock.now_ms())
    }

    fn record_key(&self, directory: &str, file: &str) -> RecordKey {
        RecordKey::new(&self.area, directory, file)
    }

    fn resolve_fields(&self, directory: &str, file: &str, data: &[u8]) -> Vec<IndexField> {
        match self.registry.resolve(data) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(%directory, %file, "indexing record without search keys: {err}");
                Vec::new()
            }
        }
    }
}

fn search_keys<'a>(
    key: &'a RecordKey,
    fields: &'a [IndexField],
) -> impl Iterator<Item = AdvSearchKey> + 'a {
    fields.iter().map(move |f| AdvSearchKey {
        area: key.area.clone(),
        directory: key.directory.clone(),
        field: f.name.clone(),
        value: f.value.clone(),
        file: key.file.clone(),
    })
}

fn expiry_key(key: &RecordKey, record: &AdvertisementRecord) -> Option<ExpiryKey<RecordKey>> {
    record.expires_at().map(|expires_at| ExpiryKey {
        expires_at,
        key: key.clone(),
    })
}

fn live_record(tx: &impl ReadTx, key: &RecordKey, now: i64) -> Result<Option<AdvertisementRecord>> {
    let Some(value) = tx.get(KeySpace::Records, &key.encode())? else {
        return Ok(None);
    };
    let record = AdvertisementRecord::from_stored(key, &value)?;
    Ok((!record.is_expired(now)).then_some(record))
}

/// Removes a record and the keys it was indexed with.
fn remove_in(tx: &mut impl WriteTx, key: &RecordKey) -> Result<bool> {
    let encoded = key.encode();
    let Some(value) = tx.get(KeySpace::Records, &encoded)? else {
        return Ok(false);
    };
    let old = AdvertisementRecord::from_stored(key, &value)?;
    for search_key in search_keys(key, &old.fields) {
        tx.delete(KeySpace::AdvIndex, &search_key.encode())?;
    }
    if let Some(expiry) = expiry_key(key, &old) {
        tx.delete(KeySpace::AdvExpiry, &expiry.encode())?;
    }
    tx.delete(KeySpace::Records, &encoded)?;
    Ok(true)
}
