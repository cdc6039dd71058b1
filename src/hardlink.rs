//! Batched hardlink creation for restore targets that can share an inode
//! with a library blob, with a device cache to keep links from ever being
//! attempted across filesystems.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashMap;
use tracing::*;

use crate::context::MOTHER_TIME_SECS;
use crate::file_util;

/// Stat results (or, on Windows, a volume-name hash) cached per path.
/// `-1` marks a failed lookup and never compares equal to anything.
#[derive(Default)]
pub struct DeviceCache {
    devices: RwLock<FxHashMap<Utf8PathBuf, i64>>,
}

impl DeviceCache {
    pub fn device_of(&self, path: &Utf8Path) -> i64 {
        if let Some(dev) = self.devices.read().unwrap().get(path) {
            return *dev;
        }
        let dev = lookup_device(path);
        self.devices.write().unwrap().insert(path.to_owned(), dev);
        dev
    }

    pub fn same_device(&self, a: &Utf8Path, b: &Utf8Path) -> bool {
        let da = self.device_of(a);
        let db = self.device_of(b);
        da != -1 && da == db
    }

    #[cfg(test)]
    pub fn pretend(&self, path: &Utf8Path, dev: i64) {
        self.devices.write().unwrap().insert(path.to_owned(), dev);
    }
}

#[cfg(unix)]
fn lookup_device(path: &Utf8Path) -> i64 {
    use std::os::unix::fs::MetadataExt;
    match fs::metadata(path) {
        Ok(meta) => meta.dev() as i64,
        Err(_) => -1,
    }
}

#[cfg(windows)]
fn lookup_device(path: &Utf8Path) -> i64 {
    // Best-effort: hash the volume prefix. Mapped drives and junctions can
    // alias to the same "device", in which case the link call itself is the
    // final arbiter.
    use std::hash::{Hash, Hasher};
    match path.components().next() {
        Some(prefix) => {
            let mut h = rustc_hash::FxHasher::default();
            prefix.as_str().hash(&mut h);
            (h.finish() & 0x7fff_ffff) as i64
        }
        None => -1,
    }
}

#[cfg(unix)]
fn same_file(a: &Utf8Path, b: &Utf8Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(ma), Ok(mb)) => ma.dev() == mb.dev() && ma.ino() == mb.ino(),
        _ => false,
    }
}

#[cfg(windows)]
fn same_file(_a: &Utf8Path, _b: &Utf8Path) -> bool {
    false
}

#[derive(Debug, Default)]
pub struct HardlinkStats {
    pub linked: AtomicUsize,
    pub skipped: AtomicUsize,
    pub cross_fs: AtomicUsize,
}

/// Queues hardlink requests per source blob, then creates them all in a
/// bounded burst of workers. Targets that can't be linked (other device,
/// link refused) come back as fallbacks for the regular copy path.
///
/// Callers must verify the source blob's content hashes to its digest
/// before queuing anything; links propagate corruption silently.
pub struct HardlinkManager {
    batches: Mutex<FxHashMap<Utf8PathBuf, Vec<Utf8PathBuf>>>,
    devices: DeviceCache,
    stats: HardlinkStats,
    dir_mode: u32,
}

impl HardlinkManager {
    pub fn new(dir_mode: u32) -> Self {
        Self {
            batches: Mutex::new(FxHashMap::default()),
            devices: DeviceCache::default(),
            stats: HardlinkStats::default(),
            dir_mode,
        }
    }

    pub fn devices(&self) -> &DeviceCache {
        &self.devices
    }

    pub fn stats(&self) -> &HardlinkStats {
        &self.stats
    }

    pub fn add_hardlink(&self, source: &Utf8Path, target: Utf8PathBuf) {
        self.batches
            .lock()
            .unwrap()
            .entry(source.to_owned())
            .or_default()
            .push(target);
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().unwrap().is_empty()
    }

    /// Create every queued link. Returns the targets that need the copy
    /// path instead.
    pub fn create_all(&self) -> Result<Vec<Utf8PathBuf>> {
        let batches: Vec<(Utf8PathBuf, Vec<Utf8PathBuf>)> =
            self.batches.lock().unwrap().drain().collect();
        if batches.is_empty() {
            return Ok(Vec::new());
        }

        let workers = num_cpus::get().min(8);
        let fallbacks = Mutex::new(Vec::new());
        let (tx, rx) = crossbeam_channel::unbounded::<(Utf8PathBuf, Vec<Utf8PathBuf>)>();
        for batch in batches {
            tx.send(batch).unwrap();
        }
        drop(tx);

        std::thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let fallbacks = &fallbacks;
                s.spawn(move || {
                    while let Ok((source, targets)) = rx.recv() {
                        for target in targets {
                            match self.link_one(&source, &target) {
                                Ok(Outcome::Linked) => {
                                    self.stats.linked.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(Outcome::Skipped) => {
                                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                                }
                                Ok(Outcome::CrossFs) => {
                                    self.stats.cross_fs.fetch_add(1, Ordering::Relaxed);
                                    fallbacks.lock().unwrap().push(target);
                                }
                                Err(e) => {
                                    debug!("Couldn't link {target}: {e:#}; falling back to copy");
                                    fallbacks.lock().unwrap().push(target);
                                }
                            }
                        }
                    }
                });
            }
        });

        Ok(fallbacks.into_inner().unwrap())
    }

    fn link_one(&self, source: &Utf8Path, target: &Utf8Path) -> Result<Outcome> {
        if target.exists() {
            if same_file(source, target) {
                return Ok(Outcome::Skipped);
            }
            fs::remove_file(target).with_context(|| format!("Couldn't remove {target}"))?;
        }

        let parent = target
            .parent()
            .with_context(|| format!("{target} has no parent"))?;
        file_util::mkdir_p(parent, self.dir_mode)?;

        if !self.devices.same_device(source, parent) {
            return Ok(Outcome::CrossFs);
        }

        fs::hard_link(source, target)
            .with_context(|| format!("Couldn't link {target} to {source}"))?;
        // Keep the tree's mtime invariant; the blob shares the inode and is
        // pinned to the same epoch anyway.
        if let Err(e) = file_util::chtimes(target, MOTHER_TIME_SECS) {
            debug!("Couldn't pin times on {target}: {e:#}");
        }
        Ok(Outcome::Linked)
    }
}

enum Outcome {
    Linked,
    Skipped,
    CrossFs,
}
