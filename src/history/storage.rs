// =============================================================================
// History Storage — the persisted blob behind the HistoryStore
// =============================================================================
//
// The store never touches the filesystem directly. It is handed a
// `HistoryStorage` capability with two operations: read the whole blob and
// replace the whole blob. Both are blocking; the store runs `save` on the
// blocking pool. Production uses `FileStorage`; tests swap in `MemoryStorage`.
// =============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

/// A single keyed blob holding the serialized history.
pub trait HistoryStorage: Send + Sync + 'static {
    /// Read the blob. `Ok(None)` means nothing has been persisted yet.
    fn load(&self) -> Result<Option<String>>;

    /// Replace the blob.
    fn save(&self, blob: &str) -> Result<()>;
}

// =============================================================================
// FileStorage
// =============================================================================

/// Blob stored as one JSON file, replaced atomically (tmp + rename).
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HistoryStorage for FileStorage {
    fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("failed to read history from {}", self.path.display())),
        }
    }

    fn save(&self, blob: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");

        std::fs::write(&tmp_path, blob)
            .with_context(|| format!("failed to write tmp history to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp history to {}", self.path.display()))?;

        debug!(path = %self.path.display(), bytes = blob.len(), "history saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// MemoryStorage (tests)
// =============================================================================

#[cfg(test)]
pub use memory::MemoryStorage;
