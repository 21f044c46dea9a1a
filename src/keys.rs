//! Order-preserving encoding of composite keys.
//!
//! Every key is a tuple of fields. Strings are written as their UTF-8 bytes with
//! `0x00` escaped as `0x00 0xFF`, followed by a single `0x00` terminator. Instants
//! are written as big-endian `i64` with the sign bit flipped. Both encodings sort
//! byte-wise in the same order as the values they encode, so the encoded tuples sort
//! field by field. The encoding of the leading fields of a tuple is a byte prefix of
//! the encoding of the whole tuple, which is what the prefix scans in
//! [`crate::cache`] and [`crate::srdi`] rely on.
//!
//! Instants only ever appear as the first field of a key. A string is never
//! followed by an instant, so a terminator can never be confused with an escape.

use std::ops::Bound;

use snafu::{ResultExt, Snafu};

use crate::error::{Result, StructuralViolationSnafu};

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0xFF;
const SIGN_BIT: u64 = 1 << 63;

/// Errors from decoding a key.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum DecodeError {
    #[snafu(display("unexpected end of key at offset {offset}"))]
    UnexpectedEnd { offset: usize },
    #[snafu(display("unterminated field starting at offset {offset}"))]
    MissingTerminator { offset: usize },
    #[snafu(display("invalid utf-8 in field starting at offset {offset}"))]
    InvalidUtf8 {
        offset: usize,
        source: std::string::FromUtf8Error,
    },
    #[snafu(display("{remaining} trailing byte(s) after key"))]
    TrailingBytes { remaining: usize },
}

/// Builds an encoded key field by field.
#[derive(Debug, Default, Clone)]
pub struct KeyWriter {
    buf: Vec<u8>,
    partial: bool,
}

impl KeyWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a complete string field.
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_escaped(s);
        self.buf.push(TERMINATOR);
        self.partial = false;
        self
    }

    /// Append the beginning of a string field, without its terminator.
    ///
    /// Only useful as the last field of a lookup prefix, see [`KeyWriter::into_range`].
    pub fn push_str_prefix(&mut self, s: &str) -> &mut Self {
        self.push_escaped(s);
        self.partial = !s.is_empty();
        self
    }

    /// Append an instant in milliseconds.
    pub fn push_instant(&mut self, instant: i64) -> &mut Self {
        self.buf
            .extend_from_slice(&((instant as u64) ^ SIGN_BIT).to_be_bytes());
        self.partial = false;
        self
    }

    fn push_escaped(&mut self, s: &str) {
        for b in s.bytes() {
            self.buf.push(b);
            if b == TERMINATOR {
                self.buf.push(ESCAPE);
            }
        }
    }

    /// The encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// The range of all keys that start with the fields written so far.
    pub fn into_range(self) -> KeyRange {
        match self.partial {
            true => KeyRange::prefix(self.buf),
            false => KeyRange::tuple_prefix(self.buf),
        }
    }
}

/// Reads the fields of an encoded key in order.
#[derive(Debug)]
pub struct KeyReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> KeyReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Whether all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    /// Read a string field.
    pub fn read_str(&mut self) -> Result<String, DecodeError> {
        let start = self.offset;
        let mut out = Vec::new();
        let mut i = start;
        while let Some(&b) = self.data.get(i) {
            if b == TERMINATOR {
                if self.data.get(i + 1) == Some(&ESCAPE) {
                    out.push(TERMINATOR);
                    i += 2;
                    continue;
                }
                self.offset = i + 1;
                return String::from_utf8(out).context(InvalidUtf8Snafu { offset: start });
            }
            out.push(b);
            i += 1;
        }
        MissingTerminatorSnafu { offset: start }.fail()
    }

    /// Read an instant field.
    pub fn read_instant(&mut self) -> Result<i64, DecodeError> {
        let offset = self.offset;
        let bytes: [u8; 8] = self
            .data
            .get(offset..offset + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| UnexpectedEndSnafu { offset }.build())?;
        self.offset += 8;
        Ok((u64::from_be_bytes(bytes) ^ SIGN_BIT) as i64)
    }

    /// Fail if any bytes are left over.
    pub fn finish(self) -> Result<(), DecodeError> {
        let remaining = self.data.len().saturating_sub(self.offset);
        snafu::ensure!(remaining == 0, TrailingBytesSnafu { remaining });
        Ok(())
    }
}

/// A composite key with an order-preserving byte encoding.
pub trait Key: Sized {
    /// Write all fields of the key.
    fn write(&self, w: &mut KeyWriter);

    /// Read the key's fields, leaving any further bytes in the reader.
    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError>;

    /// Encode the key.
    fn encode(&self) -> Vec<u8> {
        let mut w = KeyWriter::new();
        self.write(&mut w);
        w.into_bytes()
    }

    /// Decode a key, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = KeyReader::new(bytes);
        let key = Self::read(&mut r)?;
        r.finish()?;
        Ok(key)
    }
}

/// Bounds for a scan over one key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// All keys whose bytes start with `prefix`.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let end = match prefix_end(&prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(prefix),
            end,
        }
    }

    /// All keys whose leading fields are exactly the complete fields in `prefix`.
    ///
    /// Unlike [`KeyRange::prefix`] this excludes keys where the last field of `prefix`
    /// continues with an escaped `0x00`.
    pub fn tuple_prefix(prefix: Vec<u8>) -> Self {
        let mut end = prefix.clone();
        end.push(ESCAPE);
        Self {
            start: Bound::Included(prefix),
            end: Bound::Excluded(end),
        }
    }

    /// All keys starting with an instant at or before `instant`.
    pub fn up_to_instant(instant: i64) -> Self {
        let end = match instant.checked_add(1) {
            Some(next) => {
                let mut w = KeyWriter::new();
                w.push_instant(next);
                Bound::Excluded(w.into_bytes())
            }
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Unbounded,
            end,
        }
    }

    /// Owned copies of the bounds.
    pub fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        (self.start.clone(), self.end.clone())
    }

    /// Borrowed bounds.
    pub fn as_ref(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (as_slice(&self.start), as_slice(&self.end))
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s.as_slice(),
            Bound::Excluded(s) => key > s.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e.as_slice(),
            Bound::Excluded(e) => key < e.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }
}

fn as_slice(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// The smallest byte string greater than every string starting with `prefix`.
///
/// Returns `None` if there is none, i.e. `prefix` is empty or all `0xFF`.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last != u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Selects index values in a secondary lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ValueFilter {
    /// Matches any value.
    #[default]
    Any,
    /// Only values that are exactly the provided value.
    Exact(String),
    /// All values that start with the provided value.
    Prefix(String),
    /// All values that end with the provided value.
    Suffix(String),
    /// All values that contain the provided value.
    Contains(String),
}

impl ValueFilter {
    /// Parse a `*` wildcard pattern.
    ///
    /// `*` alone matches anything, `abc*` is a prefix, `*abc` a suffix and `*abc*` a
    /// substring match. Anything else matches exactly.
    pub fn from_wildcard(pattern: &str) -> Self {
        if pattern == "*" {
            return ValueFilter::Any;
        }
        match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
            (Some(rest), Some(_)) => {
                let inner = rest.strip_suffix('*').unwrap_or(rest);
                ValueFilter::Contains(inner.to_string())
            }
            (Some(rest), None) => ValueFilter::Suffix(rest.to_string()),
            (None, Some(rest)) => ValueFilter::Prefix(rest.to_string()),
            (None, None) => ValueFilter::Exact(pattern.to_string()),
        }
    }

    /// Test if a value is matched by this filter.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(v) => v == value,
            Self::Prefix(p) => value.starts_with(p.as_str()),
            Self::Suffix(s) => value.ends_with(s.as_str()),
            Self::Contains(c) => value.contains(c.as_str()),
        }
    }

    /// Append the part of the filter that can be expressed as a key prefix.
    pub(crate) fn write_prefix(&self, w: &mut KeyWriter) {
        match self {
            Self::Exact(v) => {
                w.push_str(v);
            }
            Self::Prefix(p) => {
                w.push_str_prefix(p);
            }
            Self::Any | Self::Suffix(_) | Self::Contains(_) => {}
        }
    }
}

impl From<&str> for ValueFilter {
    fn from(value: &str) -> Self {
        ValueFilter::Exact(value.to_string())
    }
}

/// Primary key of an advertisement record: `(area, directory, file)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Cache area the record lives in.
    pub area: String,
    /// Directory inside the area.
    pub directory: String,
    /// File name inside the directory.
    pub file: String,
}

impl RecordKey {
    /// Create a record key.
    pub fn new(
        area: impl Into<String>,
        directory: impl Into<String>,
        file: impl Into<String>,
    ) -> Self {
        Self {
            area: area.into(),
            directory: directory.into(),
            file: file.into(),
        }
    }

    /// All records of a directory.
    pub fn directory_range(area: &str, directory: &str) -> KeyRange {
        let mut w = KeyWriter::new();
        w.push_str(area).push_str(directory);
        w.into_range()
    }
}

impl Key for RecordKey {
    fn write(&self, w: &mut KeyWriter) {
        w.push_str(&self.area)
            .push_str(&self.directory)
            .push_str(&self.file);
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            area: r.read_str()?,
            directory: r.read_str()?,
            file: r.read_str()?,
        })
    }
}

/// Secondary index key of an advertisement: `(area, directory, field, value, file)`.
///
/// The trailing file name makes the key unique, so one `(field, value)` pair can
/// reference many records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdvSearchKey {
    /// Cache area the record lives in.
    pub area: String,
    /// Directory inside the area.
    pub directory: String,
    /// Name of the index field.
    pub field: String,
    /// Value of the index field.
    pub value: String,
    /// File name of the referenced record.
    pub file: String,
}

impl AdvSearchKey {
    /// The primary key this search key references.
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(&self.area, &self.directory, &self.file)
    }

    /// All search keys of one field whose value passes the prefix part of `filter`.
    pub fn field_range(area: &str, directory: &str, field: &str, filter: &ValueFilter) -> KeyRange {
        let mut w = KeyWriter::new();
        w.push_str(area).push_str(directory).push_str(field);
        filter.write_prefix(&mut w);
        w.into_range()
    }

    /// All search keys of a directory.
    pub fn directory_range(area: &str, directory: &str) -> KeyRange {
        RecordKey::directory_range(area, directory)
    }
}

impl Key for AdvSearchKey {
    fn write(&self, w: &mut KeyWriter) {
        w.push_str(&self.area)
            .push_str(&self.directory)
            .push_str(&self.field)
            .push_str(&self.value)
            .push_str(&self.file);
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            area: r.read_str()?,
            directory: r.read_str()?,
            field: r.read_str()?,
            value: r.read_str()?,
            file: r.read_str()?,
        })
    }
}

/// Expiry index key: the absolute expiration instant followed by the expiring key.
///
/// Carries no group or index identity of its own, so a single scan over instants
/// finds every due entry in the key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryKey<K> {
    /// Absolute expiration in milliseconds.
    pub expires_at: i64,
    /// The key that expires.
    pub key: K,
}

impl<K: Key> ExpiryKey<K> {
    /// All expiry keys due at or before `now`.
    pub fn due_range(now: i64) -> KeyRange {
        KeyRange::up_to_instant(now)
    }
}

impl<K: Key> Key for ExpiryKey<K> {
    fn write(&self, w: &mut KeyWriter) {
        w.push_instant(self.expires_at);
        self.key.write(w);
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        let expires_at = r.read_instant()?;
        let key = K::read(r)?;
        Ok(Self { expires_at, key })
    }
}

/// How many leading fields of an [`SrdiIndexKey`] are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Depth {
    /// Group only.
    Group,
    /// Group and index name.
    Index,
    /// Up to the primary key.
    PrimaryKey,
    /// Up to the attribute.
    Attribute,
    /// Up to the value.
    Value,
    /// All fields including the contributing peer.
    Peer,
}

impl Depth {
    const FIELDS: [&'static str; 6] = [
        "group",
        "index",
        "primary key",
        "attribute",
        "value",
        "peer",
    ];

    fn from_len(len: usize) -> Option<Self> {
        match len {
            1 => Some(Depth::Group),
            2 => Some(Depth::Index),
            3 => Some(Depth::PrimaryKey),
            4 => Some(Depth::Attribute),
            5 => Some(Depth::Value),
            6 => Some(Depth::Peer),
            _ => None,
        }
    }

    /// Number of fields present at this depth.
    pub fn field_count(self) -> usize {
        self as usize + 1
    }
}

/// SRDI key: `(group, index, primary key, attribute, value, peer)`.
///
/// Trailing fields may be omitted to address every key below a prefix, but a field
/// can never be present after an omitted one. The key stores only its present
/// fields, so the [`Depth`] always describes a valid prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SrdiIndexKey {
    parts: Vec<String>,
}

impl SrdiIndexKey {
    /// Key addressing a whole group.
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            parts: vec![group.into()],
        }
    }

    /// Key addressing one index of a group.
    pub fn index(group: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            parts: vec![group.into(), index.into()],
        }
    }

    /// Key addressing one `(attribute, value)` of a primary key, for every peer.
    pub fn value(
        group: impl Into<String>,
        index: impl Into<String>,
        primary_key: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            parts: vec![
                group.into(),
                index.into(),
                primary_key.into(),
                attribute.into(),
                value.into(),
            ],
        }
    }

    /// A complete key for one peer's contribution.
    pub fn full(
        group: impl Into<String>,
        index: impl Into<String>,
        primary_key: impl Into<String>,
        attribute: impl Into<String>,
        value: impl Into<String>,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            parts: vec![
                group.into(),
                index.into(),
                primary_key.into(),
                attribute.into(),
                value.into(),
                peer.into(),
            ],
        }
    }

    /// Build a key from individually optional fields.
    ///
    /// Fails with [`crate::Error::StructuralViolation`] if a field is present after an
    /// omitted one.
    pub fn from_parts(
        group: impl Into<String>,
        index: Option<String>,
        primary_key: Option<String>,
        attribute: Option<String>,
        value: Option<String>,
        peer: Option<String>,
    ) -> Result<Self> {
        let mut parts = vec![group.into()];
        let mut missing = None;
        for (i, part) in [index, primary_key, attribute, value, peer]
            .into_iter()
            .enumerate()
        {
            match (part, missing) {
                (Some(part), None) => parts.push(part),
                (Some(_), Some(gap)) => {
                    return StructuralViolationSnafu {
                        message: format!(
                            "{} is set but {} is not",
                            Depth::FIELDS[i + 1],
                            Depth::FIELDS[gap]
                        ),
                    }
                    .fail();
                }
                (None, None) => missing = Some(i + 1),
                (None, Some(_)) => {}
            }
        }
        Ok(Self { parts })
    }

    /// How many fields are present.
    pub fn depth(&self) -> Depth {
        // constructors never produce an empty key
        Depth::from_len(self.parts.len()).unwrap_or(Depth::Group)
    }

    /// Whether every field is present.
    pub fn is_full(&self) -> bool {
        self.depth() == Depth::Peer
    }

    /// Group id.
    pub fn group_id(&self) -> &str {
        &self.parts[0]
    }

    /// Index name.
    pub fn index_name(&self) -> Option<&str> {
        self.part(1)
    }

    /// Primary key.
    pub fn primary_key(&self) -> Option<&str> {
        self.part(2)
    }

    /// Attribute name.
    pub fn attribute(&self) -> Option<&str> {
        self.part(3)
    }

    /// Attribute value.
    pub fn attr_value(&self) -> Option<&str> {
        self.part(4)
    }

    /// Contributing peer.
    pub fn peer(&self) -> Option<&str> {
        self.part(5)
    }

    fn part(&self, i: usize) -> Option<&str> {
        self.parts.get(i).map(String::as_str)
    }

    /// The range of all keys below this one, including itself.
    pub fn prefix_range(&self) -> KeyRange {
        KeyRange::tuple_prefix(self.encode())
    }

    fn complete(&self) -> Result<&[String; 6]> {
        match <&[String; 6]>::try_from(self.parts.as_slice()) {
            Ok(parts) => Ok(parts),
            Err(_) => StructuralViolationSnafu {
                message: format!("expected a complete key, got depth {:?}", self.depth()),
            }
            .fail(),
        }
    }

    /// The by-peer projection of a complete key.
    pub fn peer_key(&self) -> Result<PeerSearchKey> {
        let [group, index, primary_key, attribute, value, peer] = self.complete()?;
        Ok(PeerSearchKey {
            group: group.clone(),
            index: index.clone(),
            peer: peer.clone(),
            primary_key: primary_key.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
        })
    }

    /// The by-attribute projection of a complete key.
    pub fn attribute_key(&self) -> Result<AttributeSearchKey> {
        let [group, index, primary_key, attribute, value, peer] = self.complete()?;
        Ok(AttributeSearchKey {
            group: group.clone(),
            index: index.clone(),
            attribute: attribute.clone(),
            value: value.clone(),
            peer: peer.clone(),
            primary_key: primary_key.clone(),
        })
    }
}

impl Key for SrdiIndexKey {
    fn write(&self, w: &mut KeyWriter) {
        for part in &self.parts {
            w.push_str(part);
        }
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        let mut parts = Vec::with_capacity(Depth::Peer.field_count());
        parts.push(r.read_str()?);
        while !r.is_empty() && parts.len() < Depth::Peer.field_count() {
            parts.push(r.read_str()?);
        }
        Ok(Self { parts })
    }
}

/// By-peer projection of an [`SrdiIndexKey`]: `(group, index, peer, primary key,
/// attribute, value)`.
///
/// Lets every contribution of one peer to an index be found with a single prefix scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerSearchKey {
    /// Group id.
    pub group: String,
    /// Index name.
    pub index: String,
    /// Contributing peer.
    pub peer: String,
    /// Primary key.
    pub primary_key: String,
    /// Attribute name.
    pub attribute: String,
    /// Attribute value.
    pub value: String,
}

impl PeerSearchKey {
    /// All contributions of `peer` to one index.
    pub fn peer_range(group: &str, index: &str, peer: &str) -> KeyRange {
        let mut w = KeyWriter::new();
        w.push_str(group).push_str(index).push_str(peer);
        w.into_range()
    }

    /// The full SRDI key this projection was taken from.
    pub fn index_key(&self) -> SrdiIndexKey {
        SrdiIndexKey::full(
            &self.group,
            &self.index,
            &self.primary_key,
            &self.attribute,
            &self.value,
            &self.peer,
        )
    }
}

impl Key for PeerSearchKey {
    fn write(&self, w: &mut KeyWriter) {
        w.push_str(&self.group)
            .push_str(&self.index)
            .push_str(&self.peer)
            .push_str(&self.primary_key)
            .push_str(&self.attribute)
            .push_str(&self.value);
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group: r.read_str()?,
            index: r.read_str()?,
            peer: r.read_str()?,
            primary_key: r.read_str()?,
            attribute: r.read_str()?,
            value: r.read_str()?,
        })
    }
}

/// By-attribute projection of an [`SrdiIndexKey`]: `(group, index, attribute, value,
/// peer, primary key)`.
///
/// Groups the peers claiming one `attribute = value` of an index under a single prefix,
/// whatever primary key they claim it for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeSearchKey {
    /// Group id.
    pub group: String,
    /// Index name.
    pub index: String,
    /// Attribute name.
    pub attribute: String,
    /// Attribute value.
    pub value: String,
    /// Contributing peer.
    pub peer: String,
    /// Primary key.
    pub primary_key: String,
}

impl AttributeSearchKey {
    /// All contributions of `attribute = value` to one index.
    pub fn value_range(group: &str, index: &str, attribute: &str, value: &str) -> KeyRange {
        let mut w = KeyWriter::new();
        w.push_str(group)
            .push_str(index)
            .push_str(attribute)
            .push_str(value);
        w.into_range()
    }

    /// The full SRDI key this projection was taken from.
    pub fn index_key(&self) -> SrdiIndexKey {
        SrdiIndexKey::full(
            &self.group,
            &self.index,
            &self.primary_key,
            &self.attribute,
            &self.value,
            &self.peer,
        )
    }
}

impl Key for AttributeSearchKey {
    fn write(&self, w: &mut KeyWriter) {
        w.push_str(&self.group)
            .push_str(&self.index)
            .push_str(&self.attribute)
            .push_str(&self.value)
            .push_str(&self.peer)
            .push_str(&self.primary_key);
    }

    fn read(r: &mut KeyReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            group: r.read_str()?,
            index: r.read_str()?,
            attribute: r.read_str()?,
            value: r.read_str()?,
            peer: r.read_str()?,
            primary_key: r.read_str()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::Error;

    fn part() -> impl Strategy<Value = String> {
        // include NUL and multi-byte characters to exercise escaping
        "[a-c\\x00\u{e9}]{0,4}"
    }

    fn string_tuple() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec(part(), 1..=6)
    }

    fn record_key() -> impl Strategy<Value = RecordKey> {
        let parts = (part(), part(), part());
        parts.prop_map(|(area, directory, file)| RecordKey {
            area,
            directory,
            file,
        })
    }

    fn adv_search_key() -> impl Strategy<Value = AdvSearchKey> {
        let parts = (part(), part(), part(), part(), part());
        parts.prop_map(|(area, directory, field, value, file)| AdvSearchKey {
            area,
            directory,
            field,
            value,
            file,
        })
    }

    fn peer_search_key() -> impl Strategy<Value = PeerSearchKey> {
        let parts = (part(), part(), part(), part(), part(), part());
        parts.prop_map(|(group, index, peer, primary_key, attribute, value)| PeerSearchKey {
            group,
            index,
            peer,
            primary_key,
            attribute,
            value,
        })
    }

    fn attribute_search_key() -> impl Strategy<Value = AttributeSearchKey> {
        let parts = (part(), part(), part(), part(), part(), part());
        parts.prop_map(|(group, index, attribute, value, peer, primary_key)| AttributeSearchKey {
            group,
            index,
            attribute,
            value,
            peer,
            primary_key,
        })
    }

    fn srdi_key(parts: &[String]) -> SrdiIndexKey {
        SrdiIndexKey {
            parts: parts.to_vec(),
        }
    }

    fn expiry(expires_at: i64) -> Vec<u8> {
        let key = RecordKey::new("a", "d", "f");
        ExpiryKey { expires_at, key }.encode()
    }

    proptest! {
        #[test]
        fn srdi_key_roundtrip(parts in string_tuple()) {
            let key = srdi_key(&parts);
            prop_assert_eq!(SrdiIndexKey::decode(&key.encode()).unwrap(), key);
        }

        #[test]
        fn encoding_preserves_tuple_order(a in string_tuple(), b in string_tuple()) {
            let (ka, kb) = (srdi_key(&a), srdi_key(&b));
            prop_assert_eq!(a.cmp(&b), ka.encode().cmp(&kb.encode()));
        }

        #[test]
        fn record_keys_roundtrip_in_order(a in record_key(), b in record_key()) {
            prop_assert_eq!(&RecordKey::decode(&a.encode()).unwrap(), &a);
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
            let range = RecordKey::directory_range(&a.area, &a.directory);
            prop_assert!(range.contains(&a.encode()));
        }

        #[test]
        fn adv_search_keys_roundtrip_in_order(a in adv_search_key(), b in adv_search_key()) {
            prop_assert_eq!(&AdvSearchKey::decode(&a.encode()).unwrap(), &a);
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
            let value = &a.value;
            for filter in [ValueFilter::Exact(value.clone()), ValueFilter::Prefix(value.clone())] {
                let range = AdvSearchKey::field_range(&a.area, &a.directory, &a.field, &filter);
                prop_assert!(range.contains(&a.encode()));
            }
        }

        #[test]
        fn peer_search_keys_roundtrip_in_order(a in peer_search_key(), b in peer_search_key()) {
            prop_assert_eq!(&PeerSearchKey::decode(&a.encode()).unwrap(), &a);
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
            prop_assert_eq!(&a.index_key().peer_key().unwrap(), &a);
            let range = PeerSearchKey::peer_range(&a.group, &a.index, &a.peer);
            prop_assert!(range.contains(&a.encode()));
        }

        #[test]
        fn attribute_search_keys_roundtrip_in_order(
            a in attribute_search_key(),
            b in attribute_search_key(),
        ) {
            prop_assert_eq!(&AttributeSearchKey::decode(&a.encode()).unwrap(), &a);
            prop_assert_eq!(a.cmp(&b), a.encode().cmp(&b.encode()));
            prop_assert_eq!(&a.index_key().attribute_key().unwrap(), &a);
            let range = AttributeSearchKey::value_range(&a.group, &a.index, &a.attribute, &a.value);
            prop_assert!(range.contains(&a.encode()));
        }

        #[test]
        fn instants_preserve_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), expiry(a).cmp(&expiry(b)));
            prop_assert_eq!(ExpiryKey::<RecordKey>::decode(&expiry(a)).unwrap().expires_at, a);
        }

        #[test]
        fn field_prefix_is_byte_prefix(parts in string_tuple()) {
            let full = srdi_key(&parts).encode();
            for len in 1..parts.len() {
                let prefix = srdi_key(&parts[..len]);
                prop_assert!(full.starts_with(&prefix.encode()));
                prop_assert!(prefix.prefix_range().contains(&full));
            }
        }
    }

    #[test]
    fn record_key_roundtrip() {
        let key = RecordKey::new("area", "peers", "p1");
        assert_eq!(RecordKey::decode(&key.encode()).unwrap(), key);
        let search = AdvSearchKey {
            area: "area".into(),
            directory: "peers".into(),
            field: "Name".into(),
            value: "al\u{0}ice".into(),
            file: "p1".into(),
        };
        assert_eq!(AdvSearchKey::decode(&search.encode()).unwrap(), search);
        assert_eq!(search.record_key(), key);
    }

    #[test]
    fn tuple_prefix_excludes_longer_field() {
        let range = SrdiIndexKey::group("a").prefix_range();
        assert!(range.contains(&SrdiIndexKey::index("a", "x").encode()));
        // "a\0b" starts with the bytes of "a" plus its terminator
        let escaped = SrdiIndexKey::index("a\u{0}b", "x").encode();
        assert!(!range.contains(&escaped));
        assert!(!range.contains(&SrdiIndexKey::index("ab", "x").encode()));
    }

    #[test]
    fn value_prefix_range() {
        let range = AdvSearchKey::field_range("a", "d", "Name", &ValueFilter::Prefix("al".into()));
        let key = |value: &str| AdvSearchKey {
            area: "a".into(),
            directory: "d".into(),
            field: "Name".into(),
            value: value.into(),
            file: "f".into(),
        };
        assert!(range.contains(&key("alice").encode()));
        assert!(range.contains(&key("al").encode()));
        assert!(!range.contains(&key("bob").encode()));
        assert!(!range.contains(&key("a").encode()));
    }

    #[test]
    fn from_parts_rejects_gaps() {
        let key = SrdiIndexKey::from_parts("g", Some("i".into()), None, None, None, None).unwrap();
        assert_eq!(key.depth(), Depth::Index);
        assert_eq!(key, SrdiIndexKey::index("g", "i"));

        let gap = SrdiIndexKey::from_parts("g", None, Some("pk".into()), None, None, None);
        assert!(matches!(gap, Err(Error::StructuralViolation { .. })));

        let err = SrdiIndexKey::from_parts(
            "g",
            Some("i".into()),
            Some("pk".into()),
            Some("attr".into()),
            None,
            Some("peer".into()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::StructuralViolation { .. }));
    }

    #[test]
    fn projections_require_full_depth() {
        let key = SrdiIndexKey::full("g", "i", "pk", "Name", "alice", "peer1");
        let by_peer = key.peer_key().unwrap();
        assert_eq!(by_peer.index_key(), key);
        let peer1 = PeerSearchKey::peer_range("g", "i", "peer1");
        assert!(peer1.contains(&by_peer.encode()));
        let peer2 = PeerSearchKey::peer_range("g", "i", "peer2");
        assert!(!peer2.contains(&by_peer.encode()));

        let by_attribute = key.attribute_key().unwrap();
        assert_eq!(by_attribute.index_key(), key);
        let alice = AttributeSearchKey::value_range("g", "i", "Name", "alice");
        assert!(alice.contains(&by_attribute.encode()));
        let alic = AttributeSearchKey::value_range("g", "i", "Name", "alic");
        assert!(!alic.contains(&by_attribute.encode()));

        let err = SrdiIndexKey::index("g", "i").peer_key().unwrap_err();
        assert!(matches!(err, Error::StructuralViolation { .. }));
        let partial = SrdiIndexKey::value("g", "i", "pk", "Name", "alice");
        let err = partial.attribute_key().unwrap_err();
        assert!(matches!(err, Error::StructuralViolation { .. }));
    }

    #[test]
    fn decode_malformed() {
        let mut truncated = RecordKey::new("area", "dir", "file").encode();
        truncated.pop();
        assert!(matches!(
            RecordKey::decode(&truncated),
            Err(DecodeError::MissingTerminator { .. })
        ));

        assert!(matches!(
            ExpiryKey::<RecordKey>::decode(&[0x80, 0, 0]),
            Err(DecodeError::UnexpectedEnd { .. })
        ));

        let mut extra = RecordKey::new("area", "dir", "file").encode();
        extra.extend_from_slice(b"x\0");
        assert!(matches!(
            RecordKey::decode(&extra),
            Err(DecodeError::TrailingBytes { remaining: 2 })
        ));

        assert!(matches!(
            RecordKey::decode(&[0xC3, 0x00, b'a', 0, b'b', 0]),
            Err(DecodeError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn due_range_is_inclusive() {
        let range = ExpiryKey::<RecordKey>::due_range(5000);
        assert!(range.contains(&expiry(-1)));
        assert!(range.contains(&expiry(5000)));
        assert!(!range.contains(&expiry(5001)));
        let everything = ExpiryKey::<RecordKey>::due_range(i64::MAX);
        assert!(everything.contains(&expiry(i64::MAX)));
    }

    #[test]
    fn wildcard_filters() {
        let parse = ValueFilter::from_wildcard;
        assert_eq!(parse("*"), ValueFilter::Any);
        assert_eq!(parse("al*"), ValueFilter::Prefix("al".into()));
        assert_eq!(parse("*ce"), ValueFilter::Suffix("ce".into()));
        assert_eq!(parse("*li*"), ValueFilter::Contains("li".into()));
        assert_eq!(parse("alice"), ValueFilter::Exact("alice".into()));
        assert!(parse("*li*").matches("alice"));
        assert!(!parse("*li*").matches("bob"));
    }
}
