//! Planning and executing the materialization of a catalog tree into a
//! target directory, reusing whatever is already correct on disk.

use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::*;

use crate::blobs::{BlobStore, ensure_digest, verify_blob};
use crate::context::{HolotreeContext, MOTHER_TIME_SECS};
use crate::counters;
use crate::fanout::Fanout;
use crate::file_util;
use crate::hardlink::HardlinkManager;
use crate::hashing::{Digest, HashingReader};
use crate::prefetch::PrefetchPool;
use crate::tree::{DirRecord, Root};
use crate::{SMALL_FILE_MAX_REWRITES, SMALL_FILE_THRESHOLD};

/// One file to write (or rewrite) in the target tree.
#[derive(Debug, Clone)]
pub struct FileTask {
    pub path: Utf8PathBuf,
    pub digest: Digest,
    pub size: u64,
    pub mode: u32,
    pub rewrite: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct SymlinkTask {
    pub path: Utf8PathBuf,
    pub target: String,
}

#[derive(Debug, Clone)]
pub struct DirTask {
    pub path: Utf8PathBuf,
    pub missing: bool,
}

/// Everything the walk decided needs doing, split the way the executor
/// schedules it.
#[derive(Debug, Default)]
pub struct RestorationPlan {
    /// Depth-first; parents always precede children.
    pub dirs: Vec<DirTask>,
    /// Files on disk the catalog knows nothing about.
    pub removals: Vec<Utf8PathBuf>,
    pub symlinks: Vec<SymlinkTask>,
    /// Batchable: small, few rewrites.
    pub small: Vec<FileTask>,
    /// One task each.
    pub large: Vec<FileTask>,
    /// Eligible to share an inode with their library blob.
    pub hardlinks: Vec<FileTask>,
    /// Directories on disk the catalog knows nothing about. Never touched
    /// by the parallel phase; only [`Restorer::cleanup_extra_dirs`] removes
    /// them.
    pub extra_dirs: Vec<Utf8PathBuf>,
    pub total_files: usize,
    pub unchanged: usize,
}

impl RestorationPlan {
    pub fn is_noop(&self) -> bool {
        self.removals.is_empty()
            && self.symlinks.is_empty()
            && self.small.is_empty()
            && self.large.is_empty()
            && self.hardlinks.is_empty()
            && self.dirs.iter().all(|d| !d.missing)
    }
}

/// Should this file share an inode with its blob instead of being copied?
/// Conservative on purpose: content must be byte-identical to the stored
/// blob (no rewrites, raw codec) and must never be chmod'd into something
/// that would leak through the shared inode.
fn hardlink_eligible(task: &FileTask, compressed: bool, use_hardlinks: bool) -> bool {
    use_hardlinks && !compressed && task.rewrite.is_empty() && task.mode & 0o111 == 0
}

/// Walks the catalog tree against what's on disk in a single pass.
///
/// `current_digests` is the previous restore's relative-path → digest map
/// (empty on first contact). A file is left alone only if it's *golden*
/// (we have no record of it changing digests) and *fresh* (size and
/// mother-time mtime match).
pub fn plan(
    root: &Root,
    target: &Utf8Path,
    current_digests: &FxHashMap<Utf8PathBuf, Digest>,
    compressed: bool,
    use_hardlinks: bool,
) -> Result<RestorationPlan> {
    let mut plan = RestorationPlan::default();
    walk(
        &root.tree,
        Utf8Path::new(""),
        target,
        current_digests,
        compressed,
        use_hardlinks,
        &mut plan,
    )?;

    plan.removals.sort();
    plan.symlinks.sort_by(|a, b| a.path.cmp(&b.path));
    plan.small.sort_by(|a, b| a.path.cmp(&b.path));
    plan.large.sort_by(|a, b| a.path.cmp(&b.path));
    plan.hardlinks.sort_by(|a, b| a.path.cmp(&b.path));
    plan.extra_dirs.sort();
    debug!(
        "Planned restore into {target}: {} dirs, {} small, {} large, {} links, {} removals, {} unchanged",
        plan.dirs.len(),
        plan.small.len(),
        plan.large.len(),
        plan.hardlinks.len(),
        plan.removals.len(),
        plan.unchanged,
    );
    Ok(plan)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DiskKind {
    File,
    Dir,
    Symlink,
}

fn walk(
    dir: &DirRecord,
    rel: &Utf8Path,
    abs: &Utf8Path,
    current_digests: &FxHashMap<Utf8PathBuf, Digest>,
    compressed: bool,
    use_hardlinks: bool,
    plan: &mut RestorationPlan,
) -> Result<()> {
    if dir.shadow {
        return Ok(());
    }
    if dir.is_symlink() {
        schedule_symlink(plan, abs, &dir.symlink);
        return Ok(());
    }

    plan.dirs.push(DirTask {
        path: abs.to_owned(),
        missing: !abs.is_dir(),
    });

    // Enumerate the existing directory once.
    let mut existing: FxHashMap<String, DiskKind> = FxHashMap::default();
    match fs::read_dir(abs) {
        Ok(entries) => {
            for entry in entries {
                let entry = entry.with_context(|| format!("Couldn't enumerate {abs}"))?;
                let Ok(name) = entry.file_name().into_string() else {
                    warn!("Skipping non-UTF-8 name under {abs}");
                    continue;
                };
                let ft = entry
                    .file_type()
                    .with_context(|| format!("Couldn't stat {abs}/{name}"))?;
                let kind = if ft.is_symlink() {
                    DiskKind::Symlink
                } else if ft.is_dir() {
                    DiskKind::Dir
                } else {
                    DiskKind::File
                };
                existing.insert(name, kind);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't enumerate {abs}"))),
    }

    for (name, kind) in &existing {
        let sub_abs = abs.join(name);
        match kind {
            DiskKind::Dir => {
                let known = dir.dirs.contains_key(name);
                if !known {
                    // Never deleted while file workers are in flight; a
                    // post pass may take it after everything drains.
                    plan.extra_dirs.push(sub_abs);
                }
            }
            DiskKind::Symlink => {
                if let Some(subdir) = dir.dirs.get(name) {
                    if subdir.is_symlink() {
                        if read_link_string(&sub_abs).as_deref() != Some(&subdir.symlink) {
                            schedule_symlink(plan, &sub_abs, &subdir.symlink);
                        } else {
                            plan.unchanged += 1;
                            plan.total_files += 1;
                        }
                    }
                    // A real directory is wanted here; the file drop /
                    // mkdir path below will run into it. Rare enough to
                    // leave to the next reconcile after cleanup.
                } else if !dir.files.contains_key(name) {
                    plan.removals.push(sub_abs);
                }
                // Symlinks the catalog tracks as files are handled with
                // the file records below.
            }
            DiskKind::File => {
                if !dir.files.contains_key(name) {
                    if file_util::is_part_file(name) {
                        trace!("Ignoring transient {sub_abs}");
                    } else {
                        plan.removals.push(sub_abs);
                    }
                }
            }
        }
    }

    for (name, file) in &dir.files {
        let sub_abs = abs.join(name);
        let sub_rel = rel.join(name);
        let on_disk = existing.get(name).copied();

        if file.is_symlink() {
            plan.total_files += 1;
            if on_disk == Some(DiskKind::Symlink)
                && read_link_string(&sub_abs).as_deref() == Some(&file.symlink)
            {
                plan.unchanged += 1;
            } else {
                schedule_symlink(plan, &sub_abs, &file.symlink);
            }
            continue;
        }

        let digest = file.digest.expect("validated catalogs digest every file");
        plan.total_files += 1;

        if on_disk == Some(DiskKind::File) {
            let golden = current_digests
                .get(&sub_rel)
                .is_none_or(|d| *d == digest);
            let fresh = fs::symlink_metadata(&sub_abs)
                .map(|m| file.matches(&m))
                .unwrap_or(false);
            if golden && fresh {
                plan.unchanged += 1;
                continue;
            }
        }

        let task = FileTask {
            path: sub_abs,
            digest,
            size: file.size,
            mode: file.mode,
            rewrite: file.rewrite.clone(),
        };
        if hardlink_eligible(&task, compressed, use_hardlinks) {
            plan.hardlinks.push(task);
        } else if task.size < SMALL_FILE_THRESHOLD && task.rewrite.len() <= SMALL_FILE_MAX_REWRITES
        {
            plan.small.push(task);
        } else {
            plan.large.push(task);
        }
    }

    for (name, subdir) in &dir.dirs {
        walk(
            subdir,
            &rel.join(name),
            &abs.join(name),
            current_digests,
            compressed,
            use_hardlinks,
            plan,
        )?;
    }
    Ok(())
}

fn schedule_symlink(plan: &mut RestorationPlan, path: &Utf8Path, target: &str) {
    plan.symlinks.push(SymlinkTask {
        path: path.to_owned(),
        target: target.to_owned(),
    });
}

fn read_link_string(path: &Utf8Path) -> Option<String> {
    fs::read_link(path)
        .ok()
        .and_then(|t| t.into_os_string().into_string().ok())
}

#[derive(Debug, Default)]
pub struct RestoreStats {
    pub dirty_files: AtomicUsize,
    pub dirty_dirs: AtomicUsize,
    pub links: AtomicUsize,
    pub duplicates: AtomicUsize,
    pub removed: AtomicUsize,
    pub cross_fs: AtomicUsize,
    pub bytes_written: AtomicU64,
    pub total_files: AtomicUsize,
}

impl RestoreStats {
    /// Fraction of the tree that had to be (re)written.
    pub fn dirtyness(&self) -> f64 {
        let total = self.total_files.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.dirty_files.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn summary(&self) -> RestoreSummary {
        RestoreSummary {
            dirty_files: self.dirty_files.load(Ordering::Relaxed),
            dirty_dirs: self.dirty_dirs.load(Ordering::Relaxed),
            links: self.links.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            cross_fs: self.cross_fs.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            total_files: self.total_files.load(Ordering::Relaxed),
            dirtyness: self.dirtyness(),
        }
    }
}

/// A point-in-time copy of [`RestoreStats`], cheap to hand to reporters.
#[derive(Debug, Default, Clone)]
pub struct RestoreSummary {
    pub dirty_files: usize,
    pub dirty_dirs: usize,
    pub links: usize,
    pub duplicates: usize,
    pub removed: usize,
    pub cross_fs: usize,
    pub bytes_written: u64,
    pub total_files: usize,
    pub dirtyness: f64,
}

/// How many small files ride in one batch task.
const BATCH_SIZE: usize = 12;
/// How far ahead of the cursor a batch asks the prefetcher to look.
const BATCH_LOOKAHEAD: usize = 3;

struct Env {
    ctx: HolotreeContext,
    store: Arc<dyn BlobStore>,
    prefetch: PrefetchPool,
    stats: RestoreStats,
}

/// Executes a [`RestorationPlan`] over a [`Fanout`] pool.
pub struct Restorer {
    env: Arc<Env>,
}

impl Restorer {
    pub fn new(ctx: HolotreeContext, store: Arc<dyn BlobStore>) -> Self {
        Self {
            env: Arc::new(Env {
                ctx,
                prefetch: PrefetchPool::new(store.clone()),
                store,
                stats: RestoreStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &RestoreStats {
        &self.env.stats
    }

    /// Run the whole plan to its barriers: directories first, then all file
    /// and symlink work, then the hardlink burst and its copy fallbacks.
    pub fn execute(&self, plan: &RestorationPlan, pool: &Fanout) -> Result<()> {
        let env = &self.env;
        env.stats
            .total_files
            .fetch_add(plan.total_files, Ordering::Relaxed);
        env.stats
            .duplicates
            .fetch_add(plan.unchanged, Ordering::Relaxed);

        // Directories land before any file task is even queued; a barrier
        // is cheaper than reasoning about queue order. Each task creates
        // only its own directory; children are their own tasks, which
        // keeps the queue linear in the tree size.
        for dir in &plan.dirs {
            let env = env.clone();
            let task = dir.clone();
            pool.submit(Box::new(move || {
                file_util::mkdir_p(&task.path, env.ctx.dir_mode())?;
                file_util::chtimes(&task.path, MOTHER_TIME_SECS)?;
                if task.missing {
                    env.stats.dirty_dirs.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }))?;
        }
        pool.sync().context("Directory creation failed")?;

        // Pre-verify hardlink sources; a bad blob falls back to the copy
        // path, which re-verifies content on the way through.
        let mut copy_fallbacks: Vec<FileTask> = Vec::new();
        let link_manager = HardlinkManager::new(env.ctx.dir_mode());
        if !plan.hardlinks.is_empty() {
            let sources: FxHashSet<Digest> =
                plan.hardlinks.iter().map(|t| t.digest).collect();
            let good = Arc::new(std::sync::Mutex::new(FxHashSet::default()));
            for digest in sources {
                let env = env.clone();
                let good = good.clone();
                pool.submit(Box::new(move || {
                    match verify_blob(&*env.store, &digest) {
                        Ok(()) => {
                            good.lock().unwrap().insert(digest);
                        }
                        Err(e) => warn!("Blob {digest} failed pre-link verification: {e:#}"),
                    }
                    Ok(())
                }))?;
            }
            pool.sync().context("Hardlink verification failed")?;

            let good = good.lock().unwrap();
            for task in &plan.hardlinks {
                if good.contains(&task.digest) {
                    link_manager
                        .add_hardlink(&env.store.exact_location(&task.digest), task.path.clone());
                } else {
                    copy_fallbacks.push(task.clone());
                }
            }
        }

        for link in &plan.symlinks {
            let env = env.clone();
            let task = link.clone();
            pool.submit(Box::new(move || {
                restore_symlink(&task.target, &task.path)?;
                env.stats.links.fetch_add(1, Ordering::Relaxed);
                env.stats.dirty_files.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))?;
        }

        for path in &plan.removals {
            let env = env.clone();
            let path = path.clone();
            pool.submit(Box::new(move || {
                file_util::try_remove(&path)?;
                env.stats.removed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }))?;
        }

        for task in plan.large.iter().chain(&copy_fallbacks) {
            let env = env.clone();
            let task = task.clone();
            pool.submit(Box::new(move || drop_file(&env, &task)))?;
        }

        for batch in plan.small.chunks(BATCH_SIZE) {
            let env = env.clone();
            let batch = batch.to_vec();
            pool.submit(Box::new(move || drop_batch(&env, &batch)))?;
        }

        pool.sync().context("Restore tasks failed")?;

        if !link_manager.is_empty() {
            let fallbacks: FxHashSet<Utf8PathBuf> =
                link_manager.create_all()?.into_iter().collect();
            env.stats.links.fetch_add(
                link_manager.stats().linked.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            env.stats.cross_fs.fetch_add(
                link_manager.stats().cross_fs.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            for task in plan.hardlinks.iter().filter(|t| fallbacks.contains(&t.path)) {
                let env = env.clone();
                let task = task.clone();
                pool.submit(Box::new(move || drop_file(&env, &task)))?;
            }
            pool.sync().context("Hardlink fallbacks failed")?;
        }

        Ok(())
    }

    /// The explicit post pass: remove directories the catalog doesn't know
    /// about. Only safe after every file task has drained, which is why it
    /// is never folded into [`Restorer::execute`]'s parallel phase.
    pub fn cleanup_extra_dirs(&self, plan: &RestorationPlan) -> Result<()> {
        for extra in plan.extra_dirs.iter().rev() {
            debug!("Removing extra directory {extra}");
            match fs::remove_dir_all(extra) {
                Ok(()) => {
                    self.env.stats.removed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!("Couldn't remove {extra}")));
                }
            }
        }
        Ok(())
    }
}

/// Race-tolerant symlink creation: on interference, re-check whether a
/// concurrent worker already left the right link behind before clobbering
/// it.
pub fn restore_symlink(target: &str, path: &Utf8Path) -> Result<()> {
    if read_link_string(path).as_deref() == Some(target) {
        return Ok(());
    }
    match symlink(target, path) {
        Ok(()) => Ok(()),
        Err(_) => {
            if read_link_string(path).as_deref() == Some(target) {
                return Ok(()); // A concurrent worker got there first.
            }
            counters::bump(counters::Op::SymlinkRetry);
            file_util::try_remove(path)?;
            symlink(target, path).with_context(|| format!("Couldn't link {path} -> {target}"))
        }
    }
}

#[cfg(unix)]
fn symlink(target: &str, path: &Utf8Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn symlink(target: &str, path: &Utf8Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

/// Materialize one file: stream the blob through a hash check into a part
/// file, patch the rewrite offsets, and atomically rename into place.
/// No error path leaves the part file behind.
fn drop_file(env: &Env, task: &FileTask) -> Result<()> {
    let mut blob = env.prefetch.get(&task.digest)?;

    // The parent was created by a directory task, but a racing cleanup may
    // have taken it out from under us.
    if let Some(parent) = task.path.parent() {
        file_util::mkdir_p(parent, env.ctx.dir_mode())?;
    }

    let part = file_util::part_name(&task.path);
    let mut write = || -> Result<()> {
        let mut fh = File::options()
            .write(true)
            .create_new(true)
            .open(&part)
            .with_context(|| format!("Couldn't create {part}"))?;

        let mut hashing = HashingReader::new(env.store.compressed(), &mut blob);
        let written = io::copy(&mut hashing, &mut fh)
            .with_context(|| format!("Couldn't write {part}"))?;
        let (actual, _) = hashing.finalize();
        ensure_digest(&task.digest, &actual, task.path.as_str())?;
        ensure!(
            written == task.size,
            "{} decoded to {written} bytes, catalog says {}",
            task.path,
            task.size
        );

        let rewrite_to = env.ctx.rewrite_bytes();
        for offset in &task.rewrite {
            ensure!(
                offset + rewrite_to.len() as u64 <= task.size,
                "Rewrite at {offset} runs past the end of {}",
                task.path
            );
            fh.seek(SeekFrom::Start(*offset))?;
            fh.write_all(&rewrite_to)
                .with_context(|| format!("Couldn't patch {part} at {offset}"))?;
        }
        fh.sync_all().with_context(|| format!("Couldn't sync {part}"))?;
        Ok(())
    };

    if let Err(e) = write().and_then(|()| file_util::commit(&part, &task.path)) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }

    file_util::set_mode(&task.path, env.ctx.file_mode(task.mode))?;
    file_util::chtimes(&task.path, MOTHER_TIME_SECS)?;
    env.stats.dirty_files.fetch_add(1, Ordering::Relaxed);
    env.stats.bytes_written.fetch_add(task.size, Ordering::Relaxed);
    Ok(())
}

/// A batch of small files, processed inline within one pool task (never
/// nested scheduling), with rolling prefetches a few files ahead.
/// One failure doesn't stop the batch; the first error resurfaces at the
/// end so the rest of the batch isn't leaked as pending work.
fn drop_batch(env: &Env, batch: &[FileTask]) -> Result<()> {
    let digests: Vec<Digest> = batch.iter().map(|t| t.digest).collect();
    let mut first_err = None;

    for (i, task) in batch.iter().enumerate() {
        let ahead = &digests[(i + 1).min(digests.len())..(i + 1 + BATCH_LOOKAHEAD).min(digests.len())];
        env.prefetch.prefetch_batch(ahead);

        if let Err(e) = drop_file(env, task) {
            debug!("Batch member {} failed: {e:#}", task.path);
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
    }
    match first_err {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
