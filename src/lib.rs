//! Advertisement cache and shared resource distributed index (SRDI) for peers.
//!
//! [`AdvertisementCache`] stores typed documents with secondary indices over their
//! declared fields and an expiry index, and feeds a [`DeltaTracker`] with index
//! mutations for replication. [`SrdiIndex`] records which peers claim
//! `attribute = value` for an index. Both persist through a [`store::Store`] and are
//! swept periodically by an [`Engine`].
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod cache;
pub mod clock;
pub mod config;
pub mod delta;
pub mod engine;
mod error;
pub mod gc;
pub mod keys;
pub mod registry;
pub mod srdi;
pub mod store;

pub use self::{
    cache::{AdvertisementCache, AdvertisementRecord, INFINITE, NO_EXPIRATION},
    clock::{Clock, ManualClock, SystemClock},
    config::Config,
    delta::{DeltaEntry, DeltaTracker},
    engine::Engine,
    error::{Error, Result},
    keys::{SrdiIndexKey, ValueFilter},
    registry::{DocumentRegistry, IndexField, JsonRegistry},
    srdi::{SrdiEntry, SrdiIndex},
};
