//! The library facade: everything a caller does to a hololib goes through
//! here, with write capability split off so read-only consumers (planners,
//! exporters) can't touch the store.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::archive;
use crate::blobs::{Blob, BlobLibrary, BlobStore, BlobStoreMut, verify_blob};
use crate::blueprint;
use crate::catalog::{self, MetaCache};
use crate::context::{HolotreeContext, current_platform};
use crate::error::HoloError;
use crate::fanout::Fanout;
use crate::file_util;
use crate::hashing::Digest;
use crate::lift;
use crate::locks::FileLock;
use crate::restore::{RestorationPlan, Restorer, RestoreSummary, plan};
use crate::tree::Root;

const LOCK_TIMEOUT_MS: u64 = 30_000;

/// Whether this process may write to the library. Decided once at open;
/// the planner and restorer only ever see the read side.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LibraryMode {
    Immutable,
    Mutable,
}

pub struct Library {
    ctx: HolotreeContext,
    store: Arc<BlobLibrary>,
    cache: MetaCache,
    mode: LibraryMode,
}

/// What the last successful restore into a space was made from.
#[derive(Debug, Serialize, Deserialize)]
struct SpaceMeta {
    identity: String,
}

impl Library {
    pub fn open(ctx: HolotreeContext) -> Self {
        Self::with_mode(ctx, LibraryMode::Mutable)
    }

    pub fn open_read_only(ctx: HolotreeContext) -> Self {
        Self::with_mode(ctx, LibraryMode::Immutable)
    }

    fn with_mode(ctx: HolotreeContext, mode: LibraryMode) -> Self {
        let store = Arc::new(BlobLibrary::new(ctx.library_dir(), ctx.compress()));
        Self {
            ctx,
            store,
            cache: MetaCache::default(),
            mode,
        }
    }

    pub fn context(&self) -> &HolotreeContext {
        &self.ctx
    }

    pub fn mode(&self) -> LibraryMode {
        self.mode
    }

    fn writable(&self) -> Result<&BlobLibrary> {
        match self.mode {
            LibraryMode::Mutable => Ok(&self.store),
            LibraryMode::Immutable => bail!("Library at {} is read-only", self.ctx.hololib()),
        }
    }

    fn catalog_path(&self, identity: &str) -> Utf8PathBuf {
        self.ctx.catalog_dir().join(identity)
    }

    /// Where the external builder should materialize an environment before
    /// [`Library::record`]. Created on demand.
    pub fn stage(&self) -> Result<Utf8PathBuf> {
        let staged = self.ctx.stage();
        fs::create_dir_all(&staged).with_context(|| format!("Couldn't create {staged}"))?;
        Ok(staged)
    }

    pub fn has_blueprint(&self, blueprint: &[u8]) -> bool {
        self.catalog_path(&blueprint::hash(blueprint)).is_file()
    }

    /// Beyond existence, check that the stored rewrite prefix matches this
    /// install's in length. A mismatch makes every rewrite offset a lie, so
    /// it must fail before any writes happen.
    pub fn validate_blueprint(&self, blueprint: &[u8]) -> Result<()> {
        let identity = blueprint::hash(blueprint);
        let root = self.cache.get_or_load(&self.catalog_path(&identity))?;
        let ours = self.ctx.rewrite_bytes().len();
        let stored = root.rewrite.len();
        if stored != ours {
            return Err(HoloError::ValidationMismatch { stored, ours }.into());
        }
        Ok(())
    }

    /// Lift whatever is staged into the library as the catalog for
    /// `blueprint`. Returns the blueprint hash.
    pub fn record(&self, blueprint: &[u8], controller: &str, space: &str) -> Result<String> {
        let store = self.writable()?;
        let _lock = FileLock::acquire(&self.ctx.lock_file(), LOCK_TIMEOUT_MS, false)?;

        let staged = self.ctx.stage();
        let pool = Fanout::new();
        let root = lift::lift(
            Arc::new(store.clone()),
            &pool,
            &staged,
            blueprint,
            controller,
            space,
        )?;
        catalog::save_as(&root, &self.catalog_path(&root.identity))?;
        Ok(root.identity)
    }

    pub fn open_blob(&self, digest: &Digest) -> Result<Blob<fs::File>> {
        self.store.open(digest)
    }

    pub fn location(&self, digest: &Digest) -> Utf8PathBuf {
        self.store.location(digest)
    }

    pub fn exact_location(&self, digest: &Digest) -> Utf8PathBuf {
        self.store.exact_location(digest)
    }

    /// Materialize `blueprint` into `holotree/<controller>/<space>`,
    /// reconciling whatever is already there.
    pub fn restore(&self, blueprint: &[u8], controller: &str, space: &str) -> Result<Utf8PathBuf> {
        self.restore_full(blueprint, controller, space, false)
            .map(|(path, _)| path)
    }

    /// Like [`Library::restore`] but keyed by a client/tag pair, and
    /// optionally partial: a partial restore writes missing and changed
    /// content but leaves extra files and directories alone.
    pub fn restore_to(
        &self,
        blueprint: &[u8],
        client: &str,
        tag: &str,
        controller: &str,
        partial: bool,
    ) -> Result<Utf8PathBuf> {
        let space = format!("{client}_{tag}");
        self.restore_full(blueprint, controller, &space, partial)
            .map(|(path, _)| path)
    }

    pub fn restore_full(
        &self,
        blueprint: &[u8],
        controller: &str,
        space: &str,
        partial: bool,
    ) -> Result<(Utf8PathBuf, RestoreSummary)> {
        self.validate_blueprint(blueprint)?;
        let _lock = FileLock::acquire(&self.ctx.lock_file(), LOCK_TIMEOUT_MS, self.ctx.shared())?;

        let identity = blueprint::hash(blueprint);
        let root = self.cache.get_or_load(&self.catalog_path(&identity))?;
        if root.platform != current_platform() {
            warn!(
                "Catalog {identity} was lifted on {}, this is {}",
                root.platform,
                current_platform()
            );
        }

        let target = self.ctx.space_path(controller, space);
        let current = self.space_digests(controller, space);
        let use_hardlinks = self.mode == LibraryMode::Mutable;

        let mut plan = plan(
            &root,
            &target,
            &current,
            self.ctx.compress(),
            use_hardlinks,
        )?;
        if partial {
            plan.removals.clear();
            plan.extra_dirs.clear();
        }

        let restorer = Restorer::new(self.ctx.clone(), self.store.clone());
        let pool = Fanout::new();
        restorer.execute(&plan, &pool)?;
        if !partial {
            restorer.cleanup_extra_dirs(&plan)?;
        }

        self.write_space_meta(controller, space, &identity)?;
        touch_use_marker(&target)?;
        let summary = restorer.stats().summary();
        debug!(
            "Restored {identity} into {target}: {} dirty of {} ({} linked, {} duplicates)",
            summary.dirty_files, summary.total_files, summary.links, summary.duplicates
        );
        Ok((target, summary))
    }

    /// Relative path → digest map recorded by the previous restore of this
    /// space, used by the planner's golden check. Missing or stale
    /// bookkeeping degrades to an empty map.
    fn space_digests(&self, controller: &str, space: &str) -> FxHashMap<Utf8PathBuf, Digest> {
        let meta_path = self.space_meta_path(controller, space);
        let Ok(bytes) = fs::read(&meta_path) else {
            return FxHashMap::default();
        };
        let Ok(meta) = serde_json::from_slice::<SpaceMeta>(&bytes) else {
            warn!("Ignoring malformed space metadata at {meta_path}");
            return FxHashMap::default();
        };
        match self.cache.get_or_load(&self.catalog_path(&meta.identity)) {
            Ok(previous) => previous.digest_map(),
            Err(_) => FxHashMap::default(),
        }
    }

    fn space_meta_path(&self, controller: &str, space: &str) -> Utf8PathBuf {
        self.ctx
            .holotree_dir()
            .join(controller)
            .join(format!("{space}.meta"))
    }

    fn write_space_meta(&self, controller: &str, space: &str, identity: &str) -> Result<()> {
        let path = self.space_meta_path(controller, space);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
        }
        let part = file_util::part_name(&path);
        fs::write(
            &part,
            serde_json::to_vec(&SpaceMeta {
                identity: identity.to_owned(),
            })?,
        )
        .with_context(|| format!("Couldn't write {part}"))?;
        file_util::commit(&part, &path)
    }

    /// All blueprint hashes with a persisted catalog.
    pub fn catalogs(&self) -> Result<Vec<String>> {
        let dir = self.ctx.catalog_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't list {dir}"))),
        };
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Ok(name) = entry.file_name().into_string() {
                if crate::hashing::plausible_digest(&name) {
                    found.push(name);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Stream every blob a catalog references through the hasher; returns
    /// the digests that are missing or corrupt.
    pub fn check_integrity(&self, blueprint: &[u8]) -> Result<Vec<Digest>> {
        let identity = blueprint::hash(blueprint);
        let root = self.cache.get_or_load(&self.catalog_path(&identity))?;
        let mut bad = Vec::new();
        for digest in root.all_digests() {
            if let Err(e) = verify_blob(&*self.store, &digest) {
                warn!("Blob {digest} failed integrity check: {e:#}");
                bad.push(digest);
            }
        }
        Ok(bad)
    }

    /// Export catalogs (by blueprint hash) and their blobs to
    /// `archive_path`. Blobs referenced by `known` catalogs are assumed
    /// present at the destination and skipped.
    pub fn export(
        &self,
        identities: &[String],
        known: &[String],
        archive_path: &Utf8Path,
    ) -> Result<()> {
        let mut roots: Vec<Arc<Root>> = Vec::new();
        for identity in identities {
            roots.push(self.cache.get_or_load(&self.catalog_path(identity))?);
        }
        let mut known_digests: FxHashSet<Digest> = FxHashSet::default();
        for identity in known {
            let root = self.cache.get_or_load(&self.catalog_path(identity))?;
            known_digests.extend(root.all_digests());
        }
        let refs: Vec<&Root> = roots.iter().map(|r| r.as_ref()).collect();
        archive::export(&*self.store, &refs, &known_digests, archive_path)
    }

    /// The default on-disk home of an exported archive.
    pub fn archive_path(&self, identity: &str) -> Utf8PathBuf {
        self.ctx.archive_dir().join(format!("{identity}.tar.zst"))
    }

    pub fn import_archive(&self, archive_path: &Utf8Path) -> Result<Vec<String>> {
        let store = self.writable()?;
        let _lock = FileLock::acquire(&self.ctx.lock_file(), LOCK_TIMEOUT_MS, false)?;
        archive::import(store, &self.ctx.catalog_dir(), archive_path)
    }

    pub fn import_zip(&self, zip_path: &Utf8Path) -> Result<Vec<String>> {
        let store = self.writable()?;
        let _lock = FileLock::acquire(&self.ctx.lock_file(), LOCK_TIMEOUT_MS, false)?;
        archive::import_zip(store, &self.ctx.hololib(), zip_path)
    }

    /// Operator-driven blob removal. No reference counting: the caller is
    /// asserting nothing needs these digests anymore.
    pub fn remove(&self, digests: &[Digest]) -> Result<()> {
        let store = self.writable()?;
        let _lock = FileLock::acquire(&self.ctx.lock_file(), LOCK_TIMEOUT_MS, false)?;
        for digest in digests {
            store.remove(digest)?;
        }
        Ok(())
    }

    pub fn trim_archives(&self, max_age_days: u64) -> Result<usize> {
        archive::trim_archives(&self.ctx.archive_dir(), max_age_days)
    }

    /// Plan without executing; what would a restore touch?
    pub fn dry_run(
        &self,
        blueprint: &[u8],
        controller: &str,
        space: &str,
    ) -> Result<RestorationPlan> {
        self.validate_blueprint(blueprint)?;
        let identity = blueprint::hash(blueprint);
        let root = self.cache.get_or_load(&self.catalog_path(&identity))?;
        let target = self.ctx.space_path(controller, space);
        let current = self.space_digests(controller, space);
        plan(&root, &target, &current, self.ctx.compress(), false)
    }
}

/// Append one `.` to the space's sibling use marker so operators can see
/// which spaces are alive; reset once it grows past 64 bytes.
fn touch_use_marker(target: &Utf8Path) -> Result<()> {
    let marker = Utf8PathBuf::from(format!("{target}.use"));
    let len = fs::metadata(&marker).map(|m| m.len()).unwrap_or(0);
    if len >= 64 {
        fs::write(&marker, b".").with_context(|| format!("Couldn't reset {marker}"))?;
    } else {
        use std::io::Write;
        let mut fh = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&marker)
            .with_context(|| format!("Couldn't open {marker}"))?;
        fh.write_all(b".")?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn init() {
        use tracing_subscriber::prelude::*;
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    }

    fn sample_library() -> (tempfile::TempDir, Library, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let home = file_util::utf8(dir.path()).unwrap().to_owned();
        let ctx = HolotreeContext::new(home);
        let lib = Library::open(ctx);

        let staged = lib.stage().unwrap();
        fs::create_dir_all(staged.join("bin")).unwrap();
        fs::write(staged.join("bin/app.py"), b"print('app')\n").unwrap();
        fs::write(staged.join("settings.yaml"), b"name: app\n").unwrap();

        let blueprint = blueprint::canonical("dependencies:\n  - python=3.11\n");
        (dir, lib, blueprint)
    }

    #[test]
    fn record_then_restore() -> Result<()> {
        init();
        let (_dir, lib, blueprint) = sample_library();

        assert!(!lib.has_blueprint(&blueprint));
        let identity = lib.record(&blueprint, "ctrl", "sp")?;
        assert!(lib.has_blueprint(&blueprint));
        assert_eq!(lib.catalogs()?, vec![identity.clone()]);
        lib.validate_blueprint(&blueprint)?;

        let (target, summary) = lib.restore_full(&blueprint, "ctrl", "sp", false)?;
        assert_eq!(fs::read(target.join("bin/app.py"))?, b"print('app')\n");
        assert_eq!(summary.dirty_files, 2);
        assert!(Utf8PathBuf::from(format!("{target}.use")).is_file());

        // Warm restore: nothing to do.
        let (_, summary) = lib.restore_full(&blueprint, "ctrl", "sp", false)?;
        assert_eq!(summary.dirty_files, 0);
        assert_eq!(summary.duplicates, summary.total_files);
        assert_eq!(lib.check_integrity(&blueprint)?, Vec::new());
        Ok(())
    }

    #[test]
    fn read_only_library_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let home = file_util::utf8(dir.path()).unwrap().to_owned();
        let lib = Library::open_read_only(HolotreeContext::new(home));
        assert!(lib.record(b"bp", "c", "s").is_err());
        assert!(lib.remove(&[]).is_err());
    }

    #[test]
    fn restore_of_unknown_blueprint_is_not_found() {
        let (_dir, lib, blueprint) = sample_library();
        let err = lib.restore(&blueprint, "ctrl", "sp").unwrap_err();
        assert!(crate::error::is_not_found(&err));
    }

    #[test]
    fn use_marker_caps_and_resets() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = file_util::utf8(dir.path())?.join("sp");
        let marker = Utf8PathBuf::from(format!("{target}.use"));
        for _ in 0..64 {
            touch_use_marker(&target)?;
        }
        assert_eq!(fs::metadata(&marker)?.len(), 64);
        touch_use_marker(&target)?;
        assert_eq!(fs::read(&marker)?, b".");
        Ok(())
    }

    #[test]
    fn export_import_round_trip() -> Result<()> {
        init();
        let (_dir, lib, blueprint) = sample_library();
        let identity = lib.record(&blueprint, "ctrl", "sp")?;
        let archive = lib.archive_path(&identity);
        lib.export(&[identity.clone()], &[], &archive)?;

        // Import into a cold library.
        let dir2 = tempfile::tempdir()?;
        let home2 = file_util::utf8(dir2.path())?.to_owned();
        let lib2 = Library::open(HolotreeContext::new(home2));
        let imported = lib2.import_archive(&archive)?;
        assert_eq!(imported, vec![identity]);
        assert!(lib2.has_blueprint(&blueprint));

        let (target, _) = lib2.restore_full(&blueprint, "ctrl", "other", false)?;
        assert_eq!(fs::read(target.join("bin/app.py"))?, b"print('app')\n");
        Ok(())
    }
}
