use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::debug;

use crate::error::{EngineError, Result};
use crate::ingest::load_and_normalize;
use crate::models::CohortSnapshot;
use crate::schema::DatasetSchema;

/// Identity of a source file's current contents: size plus mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFingerprint {
    len: u64,
    modified: Option<SystemTime>,
}

impl SourceFingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::SourceNotFound {
                path: path.to_path_buf(),
            },
            _ => EngineError::Io(e),
        })?;
        Ok(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

struct CacheEntry {
    fingerprint: SourceFingerprint,
    snapshot: Arc<CohortSnapshot>,
}

/// Loaded snapshots keyed by (source path, schema version).
///
/// An entry is reused while the file's fingerprint is unchanged; a changed
/// file is reloaded on the next lookup. Callers can also drop entries by hand.
#[derive(Default)]
pub struct SnapshotCache {
    entries: HashMap<(PathBuf, String), CacheEntry>,
    hits: usize,
    misses: usize,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &mut self,
        source: &Path,
        schema: &DatasetSchema,
    ) -> Result<Arc<CohortSnapshot>> {
        let key = (source.to_path_buf(), schema.cache_key());
        let fingerprint = match SourceFingerprint::of(source) {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                self.entries.remove(&key);
                return Err(e);
            }
        };

        if let Some(entry) = self.entries.get(&key) {
            if entry.fingerprint == fingerprint {
                self.hits += 1;
                debug!("cache hit for {} ({})", source.display(), key.1);
                return Ok(Arc::clone(&entry.snapshot));
            }
            debug!("{} changed on disk, reloading", source.display());
        }

        self.misses += 1;
        let snapshot = Arc::new(load_and_normalize(source, schema)?);
        self.entries.insert(
            key,
            CacheEntry {
                fingerprint,
                snapshot: Arc::clone(&snapshot),
            },
        );
        Ok(snapshot)
    }

    /// Drop every entry for `source`, whatever schema loaded it.
    pub fn invalidate(&mut self, source: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(path, _), _| path != source);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}
