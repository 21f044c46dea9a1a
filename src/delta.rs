//! Change feed of index field mutations, drained by the replication layer.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::registry::{DocumentRegistry, IndexField};

/// One observed index mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Index field name.
    pub field: String,
    /// Index field value.
    pub value: String,
    /// Relative expiration of the mutation in milliseconds.
    pub expiry: i64,
}

#[derive(Debug, Default)]
struct Inner {
    enabled: bool,
    pending: HashMap<String, Vec<DeltaEntry>>,
}

/// Collects index mutations per namespace until they are drained.
///
/// Appending and draining each happen under a single lock, so every entry is returned
/// by exactly one [`DeltaTracker::drain`].
#[derive(Debug)]
pub struct DeltaTracker {
    registry: Arc<dyn DocumentRegistry>,
    inner: Mutex<Inner>,
}

impl DeltaTracker {
    /// Create a tracker with tracking disabled.
    pub fn new(registry: Arc<dyn DocumentRegistry>) -> Self {
        Self {
            registry,
            inner: Default::default(),
        }
    }

    /// Enable or disable tracking. Pending entries are kept either way.
    pub fn set_tracking(&self, enabled: bool) {
        self.inner.lock().enabled = enabled;
    }

    /// Whether tracking is enabled.
    pub fn is_tracking(&self) -> bool {
        self.inner.lock().enabled
    }

    /// Append one entry per index field of `document` to `namespace`.
    ///
    /// `fields` may carry already resolved fields; otherwise they are resolved from
    /// the document. Does nothing if tracking is disabled or `expiry <= 0`. A document
    /// that cannot be parsed is logged and contributes no entries.
    pub fn record(
        &self,
        namespace: &str,
        document: &[u8],
        fields: Option<&[IndexField]>,
        expiry: i64,
    ) {
        if !self.is_tracking() || expiry <= 0 {
            return;
        }
        match fields {
            Some(fields) => self.record_fields(namespace, fields, expiry),
            None => match self.registry.resolve(document) {
                Ok(fields) => self.record_fields(namespace, &fields, expiry),
                Err(err) => warn!(%namespace, "skipping deltas for unparsable document: {err}"),
            },
        }
    }

    pub(crate) fn record_fields(&self, namespace: &str, fields: &[IndexField], expiry: i64) {
        if fields.is_empty() || expiry <= 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.enabled {
            return;
        }
        trace!(%namespace, count = fields.len(), "recording deltas");
        inner
            .pending
            .entry(namespace.to_string())
            .or_default()
            .extend(fields.iter().map(|f| DeltaEntry {
                field: f.name.clone(),
                value: f.value.clone(),
                expiry,
            }));
    }

    /// Take all pending entries of `namespace`, leaving none behind.
    pub fn drain(&self, namespace: &str) -> Vec<DeltaEntry> {
        self.inner
            .lock()
            .pending
            .remove(namespace)
            .unwrap_or_default()
    }

    /// Discard the pending entries of `namespace`. Does nothing while tracking is disabled.
    pub fn clear(&self, namespace: &str) {
        let mut inner = self.inner.lock();
        if inner.enabled {
            inner.pending.remove(namespace);
        }
    }
}
