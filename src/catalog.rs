//! Catalog persistence under `hololib/catalog/<blueprint-hash>` and the
//! bounded metadata cache that keeps hot catalogs parsed.

use std::fs;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use lru::LruCache;
use tempfile::NamedTempFile;
use tracing::*;

use crate::counters;
use crate::error::HoloError;
use crate::tree::Root;

/// Writes the catalog as JSON via tempfile + atomic rename. The file's
/// mtime doubles as the cache-validity token, so never write in place.
pub fn save_as(root: &Root, path: &Utf8Path) -> Result<()> {
    root.validate()?;
    let parent = path
        .parent()
        .with_context(|| format!("Catalog path {path} has no parent"))?;
    fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;

    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Couldn't open a temporary catalog in {parent}"))?;
    serde_json::to_writer_pretty(&mut temp, root)?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("Couldn't sync catalog for {path}"))?;
    temp.persist(path)
        .with_context(|| format!("Couldn't persist catalog to {path}"))?;
    debug!("Wrote catalog {path} ({} files)", root.file_count());
    Ok(())
}

/// Loads and structurally validates a catalog.
pub fn load_from(path: &Utf8Path) -> Result<Root> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(anyhow::Error::new(HoloError::NotFound(
                path.file_name().unwrap_or_default().to_owned(),
            ))
            .context(format!("No catalog at {path}")));
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't read {path}"))),
    };
    let root: Root =
        serde_json::from_slice(&bytes).with_context(|| format!("Couldn't parse {path}"))?;
    root.validate()
        .with_context(|| format!("Catalog {path} is malformed"))?;
    Ok(root)
}

const CACHE_CAPACITY: usize = 100;

struct CacheEntry {
    root: Arc<Root>,
    /// The catalog file's mtime when we parsed it.
    cached_mtime: SystemTime,
}

/// A bounded LRU of parsed catalogs keyed by path, validated against the
/// file's mtime on every lookup. Purely an optimization: a cold cache
/// produces identical results, just slower.
pub struct MetaCache {
    entries: Mutex<LruCache<Utf8PathBuf, CacheEntry>>,
}

impl Default for MetaCache {
    fn default() -> Self {
        Self::with_capacity(CACHE_CAPACITY)
    }
}

impl MetaCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be nonzero"),
            )),
        }
    }

    pub fn get_or_load(&self, path: &Utf8Path) -> Result<Arc<Root>> {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(anyhow::Error::new(HoloError::NotFound(
                    path.file_name().unwrap_or_default().to_owned(),
                ))
                .context(format!("No catalog at {path}")));
            }
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't stat {path}"))),
        };
        let mtime = meta
            .modified()
            .with_context(|| format!("Couldn't read mtime of {path}"))?;

        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(entry) = entries.get(path) {
                if mtime <= entry.cached_mtime {
                    counters::bump(counters::Op::MetaCacheHit);
                    return Ok(entry.root.clone());
                }
                trace!("Catalog {path} changed on disk, reloading");
            }
        }

        // Parse outside the lock; a rewritten catalog can be big.
        counters::bump(counters::Op::MetaCacheMiss);
        let root = Arc::new(load_from(path)?);

        let mut entries = self.entries.lock().unwrap();
        if let Some((evicted, _)) = entries.push(
            path.to_owned(),
            CacheEntry {
                root: root.clone(),
                cached_mtime: mtime,
            },
        ) {
            if evicted != path {
                counters::bump(counters::Op::MetaCacheEviction);
            }
        }
        Ok(root)
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn contains(&self, path: &Utf8Path) -> bool {
        self.entries.lock().unwrap().peek(path).is_some()
    }
}
