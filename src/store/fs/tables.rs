#![allow(missing_docs)]
// Table Definitions

use redb::TableDefinition;

use crate::store::KeySpace;

/// Table: Advertisement records
/// Key:   `(area, directory, file)`
/// Value: postcard encoded record
pub const RECORDS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("adv-records-1");

/// Table: Advertisement search keys
/// Key:   `(area, directory, field, value, file)`
/// Value: empty
pub const ADV_INDEX_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("adv-index-1");

/// Table: Advertisement expiry
/// Key:   `(expires_at, area, directory, file)`
/// Value: empty
pub const ADV_EXPIRY_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("adv-expiry-1");

/// Table: SRDI entries
/// Key:   `(group, index, primary_key, attribute, value, peer)`
/// Value: postcard encoded absolute expiration
pub const SRDI_ENTRIES_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("srdi-entries-1");

/// Table: SRDI entries by peer
/// Key:   `(group, index, peer, primary_key, attribute, value)`
/// Value: empty
pub const SRDI_BY_PEER_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("srdi-by-peer-1");

/// Table: SRDI entries by attribute value
/// Key:   `(group, index, attribute, value, peer, primary_key)`
/// Value: empty
pub const SRDI_BY_ATTRIBUTE_TABLE: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("srdi-by-attribute-1");

/// Table: SRDI expiry
/// Key:   `(expires_at, group, index, primary_key, attribute, value, peer)`
/// Value: empty
pub const SRDI_EXPIRY_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("srdi-expiry-1");

pub type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

pub fn table(space: KeySpace) -> BytesTable {
    match space {
        KeySpace::Records => RECORDS_TABLE,
        KeySpace::AdvIndex => ADV_INDEX_TABLE,
        KeySpace::AdvExpiry => ADV_EXPIRY_TABLE,
        KeySpace::SrdiEntries => SRDI_ENTRIES_TABLE,
        KeySpace::SrdiByPeer => SRDI_BY_PEER_TABLE,
        KeySpace::SrdiByAttribute => SRDI_BY_ATTRIBUTE_TABLE,
        KeySpace::SrdiExpiry => SRDI_EXPIRY_TABLE,
    }
}
