//! Configuration for the index engine

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

use crate::{
    error::{NoDataDirSnafu, ParseConfigSnafu, ReadConfigSnafu, Result},
    srdi::DEFAULT_QUERY_THRESHOLD,
    store::fs::FsStore,
};

const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Engine configuration
///
/// The config is usually loaded from a file with [`Self::load`].
///
/// The struct also implements [`Default`] which creates an in-memory config suitable for
/// tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the database file.
    ///
    /// If set to `None` the database is kept in memory.
    pub path: Option<PathBuf>,
    /// Interval between garbage collection sweeps.
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Whether advertisement puts are recorded as deltas from the start.
    pub track_deltas: bool,
    /// Result cap for SRDI queries that do not pass one.
    pub query_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            gc_interval: DEFAULT_GC_INTERVAL,
            track_deltas: false,
            query_threshold: DEFAULT_QUERY_THRESHOLD,
        }
    }
}

impl Config {
    /// Load the config from a file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let s = tokio::fs::read_to_string(path)
            .await
            .context(ReadConfigSnafu { path })?;
        let config: Config = toml::from_str(&s).context(ParseConfigSnafu)?;
        Ok(config)
    }

    /// Get the data directory.
    pub fn data_dir() -> Result<PathBuf> {
        let dir = if let Some(val) = env::var_os("IROH_SRDI_DATA_DIR") {
            PathBuf::from(val)
        } else {
            let path = dirs_next::data_dir().context(NoDataDirSnafu)?;
            path.join("iroh-srdi")
        };
        Ok(dir)
    }

    /// Get the default path of the database file.
    pub fn store_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("srdi-1.db"))
    }

    /// Open the store this config describes.
    pub fn open_store(&self) -> Result<FsStore> {
        match &self.path {
            Some(path) => FsStore::persistent(path),
            None => FsStore::in_memory(),
        }
    }
}
