//! A pool of prefetch workers that pull blobs off disk ahead of the
//! restorers that will consume them, with a small LRU over the loaded
//! stored-form bytes and a hit-rate-driven readahead depth.

use std::io::{self, Cursor, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use lru::LruCache;
use tracing::*;

use crate::blobs::{Blob, BlobStore, sniff};
use crate::counters;
use crate::hashing::Digest;

const FEED_SLOTS: usize = 100;
const WORKERS: usize = 4;
const CACHE_CAPACITY: usize = 24;

/// Stored forms bigger than this are opened straight from the library each
/// time instead of being parked in memory.
const MAX_CACHED_BYTES: u64 = 8 * 1024 * 1024;

const DEPTH_MIN: usize = 1;
const DEPTH_MAX: usize = 5;

#[derive(Clone)]
enum Payload {
    /// A worker (or a Get) is reading it off disk right now.
    Loading,
    /// Stored-form bytes, shared by every reader handed out.
    Cached(Arc<Vec<u8>>),
    /// Too big to park in memory; readers open the library directly.
    Uncachable,
    /// The load failed; the next Get retries the library and surfaces the
    /// real error.
    Failed,
}

struct Entry {
    payload: Payload,
    consumed: bool,
}

struct Shared {
    cache: Mutex<LruCache<Digest, Entry>>,
    ready: Condvar,
    /// Readahead depth, clamped to `[1, 5]`: +1 per Get hit, −1 per miss.
    /// No hysteresis, so mixed workloads make it oscillate; it converges
    /// fast enough on the streaming loads it exists for.
    depth: AtomicUsize,
    store: Arc<dyn BlobStore>,
}

pub struct PrefetchPool {
    shared: Arc<Shared>,
    feed: Option<Sender<Digest>>,
    workers: Vec<JoinHandle<()>>,
}

/// Bytes shared between concurrent readers of the same cached blob.
#[derive(Debug)]
pub struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A decoded blob stream, either over cached bytes or a library file.
#[derive(Debug)]
pub enum BlobHandle {
    Mem(Blob<Cursor<SharedBytes>>),
    File(Blob<std::fs::File>),
}

impl Read for BlobHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BlobHandle::Mem(r) => r.read(buf),
            BlobHandle::File(r) => r.read(buf),
        }
    }
}

impl PrefetchPool {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        let shared = Arc::new(Shared {
            cache: Mutex::new(LruCache::unbounded()),
            ready: Condvar::new(),
            depth: AtomicUsize::new(DEPTH_MIN),
            store,
        });

        let (tx, rx) = bounded::<Digest>(FEED_SLOTS);
        let workers = (0..WORKERS)
            .map(|i| {
                let rx: Receiver<Digest> = rx.clone();
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("prefetch-{i}"))
                    .spawn(move || prefetch_worker(rx, shared))
                    .expect("spawning a prefetch worker failed")
            })
            .collect();

        Self {
            shared,
            feed: Some(tx),
            workers,
        }
    }

    /// Ask the workers to warm a digest. Never blocks; a full queue drops
    /// the request on the floor as backpressure.
    pub fn prefetch(&self, digest: Digest) {
        if let Some(feed) = &self.feed {
            match feed.try_send(digest) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => counters::bump(counters::Op::PrefetchDrop),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
    }

    /// Warm the first `depth` digests of an upcoming batch.
    pub fn prefetch_batch(&self, digests: &[Digest]) {
        let depth = self.shared.depth.load(Ordering::Relaxed);
        for d in digests.iter().take(depth) {
            self.prefetch(*d);
        }
    }

    /// Fetch a blob, served from cache when a prefetch beat us here.
    ///
    /// The entry is marked consumed but stays cached, so a second
    /// concurrent Get for the same digest shares the load instead of
    /// racing a removal.
    pub fn get(&self, digest: &Digest) -> Result<BlobHandle> {
        let mut cache = self.shared.cache.lock().unwrap();
        loop {
            let seen = match cache.get_mut(digest) {
                None => None,
                Some(entry) => {
                    let payload = entry.payload.clone();
                    if !matches!(payload, Payload::Loading) {
                        entry.consumed = true;
                    }
                    Some(payload)
                }
            };

            match seen {
                None => {
                    cache.put(
                        *digest,
                        Entry {
                            payload: Payload::Loading,
                            consumed: true,
                        },
                    );
                    drop(cache);

                    self.miss();
                    let payload = load(&*self.shared.store, digest);
                    let result = self.reader_for(digest, &payload);

                    let mut cache = self.shared.cache.lock().unwrap();
                    if let Some(entry) = cache.get_mut(digest) {
                        entry.payload = payload;
                        entry.consumed = true;
                    }
                    evict_over_capacity(&mut cache);
                    drop(cache);
                    self.shared.ready.notify_all();
                    return result;
                }
                Some(Payload::Loading) => {
                    cache = self.shared.ready.wait(cache).unwrap();
                }
                Some(payload @ (Payload::Cached(_) | Payload::Uncachable)) => {
                    drop(cache);
                    self.hit();
                    return self.reader_for(digest, &payload);
                }
                Some(Payload::Failed) => {
                    drop(cache);
                    self.miss();
                    // Retry directly so the caller sees the real error.
                    return Ok(BlobHandle::File(self.shared.store.open(digest)?));
                }
            }
        }
    }

    /// Stop the workers, drop every cached entry, reset the depth.
    pub fn clear(&mut self) {
        self.feed = None;
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
        self.shared.cache.lock().unwrap().clear();
        self.shared.depth.store(DEPTH_MIN, Ordering::Relaxed);
    }

    fn reader_for(&self, digest: &Digest, payload: &Payload) -> Result<BlobHandle> {
        match payload {
            Payload::Cached(bytes) => {
                let codec = sniff(&bytes[..bytes.len().min(4)]);
                Ok(BlobHandle::Mem(Blob::decode(
                    codec,
                    Cursor::new(SharedBytes(bytes.clone())),
                )?))
            }
            Payload::Uncachable | Payload::Failed | Payload::Loading => {
                Ok(BlobHandle::File(self.shared.store.open(digest)?))
            }
        }
    }

    fn hit(&self) {
        counters::bump(counters::Op::PrefetchHit);
        let _ = self
            .shared
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                (d < DEPTH_MAX).then_some(d + 1)
            });
    }

    fn miss(&self) {
        counters::bump(counters::Op::PrefetchMiss);
        let _ = self
            .shared
            .depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                (d > DEPTH_MIN).then_some(d - 1)
            });
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }
}

impl Drop for PrefetchPool {
    fn drop(&mut self) {
        self.clear();
    }
}

fn prefetch_worker(rx: Receiver<Digest>, shared: Arc<Shared>) {
    while let Ok(digest) = rx.recv() {
        {
            let mut cache = shared.cache.lock().unwrap();
            if cache.contains(&digest) {
                continue; // Someone else is on it (or already was).
            }
            cache.put(digest, Entry {
                payload: Payload::Loading,
                consumed: false,
            });
        }

        let payload = load(&*shared.store, &digest);
        let mut cache = shared.cache.lock().unwrap();
        if let Some(entry) = cache.get_mut(&digest) {
            entry.payload = payload;
        }
        evict_over_capacity(&mut cache);
        drop(cache);
        shared.ready.notify_all();
    }
}

fn load(store: &dyn BlobStore, digest: &Digest) -> Payload {
    let path = store.exact_location(digest);
    match std::fs::metadata(&path) {
        Ok(meta) if meta.len() > MAX_CACHED_BYTES => return Payload::Uncachable,
        Ok(_) => {}
        Err(e) => {
            trace!("Prefetch of {digest} failed to stat {path}: {e}");
            return Payload::Failed;
        }
    }
    match store.open_stored(digest) {
        Ok(mut fh) => {
            let mut bytes = Vec::new();
            match fh.read_to_end(&mut bytes) {
                Ok(_) => Payload::Cached(Arc::new(bytes)),
                Err(e) => {
                    trace!("Prefetch of {digest} failed reading: {e}");
                    Payload::Failed
                }
            }
        }
        Err(e) => {
            trace!("Prefetch of {digest} failed: {e}");
            Payload::Failed
        }
    }
}

/// Trim the LRU back to capacity: consumed entries near the tail go first,
/// otherwise the tail itself. Never evicts an entry mid-load.
fn evict_over_capacity(cache: &mut LruCache<Digest, Entry>) {
    while cache.len() > CACHE_CAPACITY {
        let victim = cache
            .iter()
            .rev()
            .find(|(_, e)| e.consumed && !matches!(e.payload, Payload::Loading))
            .or_else(|| {
                cache
                    .iter()
                    .rev()
                    .find(|(_, e)| !matches!(e.payload, Payload::Loading))
            })
            .map(|(k, _)| *k);
        match victim {
            Some(k) => {
                cache.pop(&k);
                counters::bump(counters::Op::PrefetchEviction);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::blobs::{BlobLibrary, BlobStoreMut};
    use crate::file_util;
    use camino::Utf8PathBuf;

    /// Counts how many times the library is actually opened.
    struct CountingStore {
        inner: BlobLibrary,
        opens: AtomicUsize,
    }

    impl BlobStore for CountingStore {
        fn location(&self, d: &Digest) -> Utf8PathBuf {
            self.inner.location(d)
        }
        fn exact_location(&self, d: &Digest) -> Utf8PathBuf {
            self.inner.exact_location(d)
        }
        fn has_blob(&self, d: &Digest) -> bool {
            self.inner.has_blob(d)
        }
        fn open(&self, d: &Digest) -> Result<Blob<std::fs::File>> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            self.inner.open(d)
        }
        fn open_stored(&self, d: &Digest) -> Result<std::fs::File> {
            self.opens.fetch_add(1, Ordering::Relaxed);
            self.inner.open_stored(d)
        }
        fn compressed(&self) -> bool {
            self.inner.compressed()
        }
    }

    fn store_with(
        dir: &tempfile::TempDir,
        contents: &[&[u8]],
    ) -> (Arc<CountingStore>, Vec<Digest>) {
        let root = file_util::utf8(dir.path()).unwrap().to_owned();
        let lib = BlobLibrary::new(root.join("library"), true);
        let digests = contents
            .iter()
            .map(|c| {
                let src = root.join("staged");
                std::fs::write(&src, c).unwrap();
                let d = Digest::hash(true, c);
                lib.lift_file(&src, &d).unwrap();
                d
            })
            .collect();
        (
            Arc::new(CountingStore {
                inner: lib,
                opens: AtomicUsize::new(0),
            }),
            digests,
        )
    }

    #[test]
    fn get_returns_content() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, digests) = store_with(&dir, &[b"hello prefetch"]);
        let pool = PrefetchPool::new(store);

        let mut content = Vec::new();
        pool.get(&digests[0])?.read_to_end(&mut content)?;
        assert_eq!(content, b"hello prefetch");
        Ok(())
    }

    #[test]
    fn concurrent_gets_share_one_open() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, digests) = store_with(&dir, &[b"contended blob"]);
        let pool = Arc::new(PrefetchPool::new(store.clone()));
        let digest = digests[0];

        let readers: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let pool = pool.clone();
                    s.spawn(move || -> Result<Vec<u8>> {
                        let mut content = Vec::new();
                        pool.get(&digest)?.read_to_end(&mut content)?;
                        Ok(content)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for r in readers {
            assert_eq!(r?, b"contended blob");
        }
        assert_eq!(store.opens.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn prefetch_then_get_hits() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, digests) = store_with(&dir, &[b"warmed"]);
        let pool = PrefetchPool::new(store.clone());

        pool.prefetch(digests[0]);
        // Wait out the worker.
        for _ in 0..100 {
            if store.opens.load(Ordering::Relaxed) > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let mut content = Vec::new();
        pool.get(&digests[0])?.read_to_end(&mut content)?;
        assert_eq!(content, b"warmed");
        assert_eq!(store.opens.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn depth_tracks_hits_and_misses() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (store, digests) = store_with(&dir, &[b"d1"]);
        let pool = PrefetchPool::new(store);

        assert_eq!(pool.depth(), DEPTH_MIN);
        // Cold get: miss, stays clamped at the floor.
        let _ = pool.get(&digests[0])?;
        assert_eq!(pool.depth(), DEPTH_MIN);
        // Now it's cached: hits walk the depth up to the ceiling.
        for _ in 0..10 {
            let _ = pool.get(&digests[0])?;
        }
        assert_eq!(pool.depth(), DEPTH_MAX);
        Ok(())
    }

    #[test]
    fn missing_blob_surfaces_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with(&dir, &[]);
        let pool = PrefetchPool::new(store);
        let ghost = Digest::hash(true, b"never stored");
        let err = pool.get(&ghost).unwrap_err();
        assert!(crate::error::is_corruption(&err));
    }
}
