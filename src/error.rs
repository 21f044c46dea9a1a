//! Error type shared by the stores and indices.

use std::path::PathBuf;

use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, Snafu};

use crate::keys::DecodeError;

/// Result alias with [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by the advertisement cache, the SRDI index and their stores.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The underlying storage medium failed. Not retried.
    #[snafu(display("storage failure"))]
    StorageFailure { source: redb::Error },
    /// A stored key could not be decoded. Indicates corruption or a format mismatch.
    #[snafu(display("malformed key"))]
    MalformedKey { source: DecodeError },
    /// A stored value could not be decoded.
    #[snafu(display("malformed value"))]
    MalformedValue { source: postcard::Error },
    #[snafu(display("failed to encode value"))]
    EncodeValue { source: postcard::Error },
    /// A key was built with a field present after an omitted one.
    #[snafu(display("structural violation: {message}"))]
    StructuralViolation { message: String },
    #[snafu(display("failed to create database directory at {}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to read config file {}", path.display()))]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("invalid config file"))]
    ParseConfig { source: toml::de::Error },
    #[snafu(display("operating environment provides no directory for application data"))]
    NoDataDir {},
}

/// Maps any redb error into [`Error::StorageFailure`].
pub(crate) fn storage(err: impl Into<redb::Error>) -> Error {
    StorageFailureSnafu.into_error(err.into())
}
