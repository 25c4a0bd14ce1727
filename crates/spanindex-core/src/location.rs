use std::path::PathBuf;

/// Where the backing store for one time bucket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLocation {
    /// `<base_path>/<timestamp>`, one per bucket.
    pub directory: PathBuf,
    /// `<base_path>/<timestamp>/<store_file_name>`, handed to the engine.
    pub path: PathBuf,
}

/// Maps a bucket timestamp to its store address.
///
/// Pure path concatenation: the timestamp must already be truncated to the
/// bucket granularity by the caller.
#[derive(Debug, Clone)]
pub struct LocationGenerator {
    base_path: PathBuf,
    store_file_name: String,
}

impl LocationGenerator {
    pub fn new(base_path: impl Into<PathBuf>, store_file_name: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            store_file_name: store_file_name.into(),
        }
    }

    pub fn generate(&self, timestamp: u64) -> StoreLocation {
        let directory = self.base_path.join(timestamp.to_string());
        let path = directory.join(&self.store_file_name);
        StoreLocation { directory, path }
    }
}
