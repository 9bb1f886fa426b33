use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Persists one byte offset per tailed source as a flat file containing the
/// decimal offset, nothing else. The file name is the source path with its
/// separators replaced by underscores, so `/var/log/app.log` is tracked in
/// `<dir>/_var_log_app.log`.
///
/// `load` never fails the caller: a missing, unreadable or unparsable file
/// means "start from zero". `save` is best effort and only logs I/O errors.
/// Each source key is owned by exactly one tailer task, so saves for a given
/// key never race.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Derive the checkpoint key for a source path.
    pub fn source_key(path: &Path) -> String {
        path.to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect()
    }

    /// Read the saved offset for `key`, or 0 if no usable record exists.
    pub fn load(&self, key: &str) -> u64 {
        let path = self.dir.join(key);
        match fs::read_to_string(&path) {
            Ok(contents) => contents.trim().parse().unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Create or truncate the record for `key` and write the offset.
    pub fn save(&self, key: &str, offset: u64) {
        let path = self.dir.join(key);
        if let Err(e) = fs::write(&path, offset.to_string()) {
            warn!(key = %key, offset, error = %e, "failed to save checkpoint");
        }
    }
}
