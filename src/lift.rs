//! The record phase: walk a staged environment, digest every file while
//! scanning for the stage prefix, insert unique blobs into the library, and
//! hand back the catalog tree.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::*;
use walkdir::WalkDir;

use crate::blobs::BlobStoreMut;
use crate::context::current_platform;
use crate::fanout::Fanout;
use crate::file_util;
use crate::hashing::digest_file;
use crate::tree::{DirRecord, FileRecord, Root};

impl DirRecord {
    /// Walk (creating as needed) to the directory record at `rel`.
    fn ensure_dir_mut(&mut self, rel: &Utf8Path) -> &mut DirRecord {
        let mut cursor = self;
        for component in rel.components() {
            let name = component.as_str().to_owned();
            cursor = cursor
                .dirs
                .entry(name.clone())
                .or_insert_with(|| DirRecord::named(name));
        }
        cursor
    }
}

/// Lift `staged` into the blob store, producing the catalog root for
/// `blueprint`. File digesting and blob insertion fan out over `pool`.
pub fn lift(
    store: Arc<dyn BlobStoreMut>,
    pool: &Fanout,
    staged: &Utf8Path,
    blueprint: &[u8],
    controller: &str,
    space: &str,
) -> Result<Root> {
    ensure!(staged.is_dir(), "Nothing staged at {staged}");
    let locator = Arc::new(staged.as_str().as_bytes().to_vec());
    info!("Lifting {staged}");

    let mut dirs: Vec<(Utf8PathBuf, Option<String>)> = Vec::new();
    let mut symlinks: Vec<(Utf8PathBuf, String, u32)> = Vec::new();
    let mut files: Vec<(Utf8PathBuf, Utf8PathBuf, u32)> = Vec::new();

    for entry in WalkDir::new(staged).sort_by_file_name().min_depth(1) {
        let entry = entry.with_context(|| format!("Couldn't walk {staged}"))?;
        let path = file_util::utf8(entry.path())?.to_owned();
        let rel = path
            .strip_prefix(staged)
            .with_context(|| format!("{path} escaped {staged}"))?
            .to_owned();
        let meta = entry
            .metadata()
            .with_context(|| format!("Couldn't stat {path}"))?;

        if entry.path_is_symlink() {
            let target = fs::read_link(&path)
                .with_context(|| format!("Couldn't read link {path}"))?;
            let target = file_util::utf8(&target)?.to_string();
            // A symlink to a directory is recorded as a directory symlink;
            // anything else (including a dangling one) as a file symlink.
            if fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                dirs.push((rel, Some(target)));
            } else {
                symlinks.push((rel, target, mode_bits(&meta)));
            }
        } else if meta.is_dir() {
            dirs.push((rel, None));
        } else {
            files.push((rel, path, mode_bits(&meta)));
        }
    }

    // Digest + lift every regular file in parallel, then assemble the tree
    // in deterministic order once the pool drains.
    let lifted: Arc<Mutex<Vec<(Utf8PathBuf, FileRecord)>>> = Arc::new(Mutex::new(Vec::new()));
    let compress = store.compressed();
    for (rel, path, mode) in &files {
        let rel = rel.clone();
        let path = path.clone();
        let mode = *mode;
        let locator = locator.clone();
        let lifted = lifted.clone();
        let store = store.clone();
        pool.submit(Box::new(move || {
            let (digest, size, rewrite) = digest_file(compress, &path, &locator)?;
            store.lift_file(&path, &digest)?;
            let name = rel.file_name().unwrap_or_default().to_owned();
            lifted.lock().unwrap().push((
                rel,
                FileRecord {
                    name,
                    digest: Some(digest),
                    size,
                    mode,
                    rewrite,
                    symlink: String::new(),
                },
            ));
            Ok(())
        }))?;
    }
    pool.sync()?;

    let mut tree = DirRecord::named("");
    for (rel, symlink) in dirs {
        let record = tree.ensure_dir_mut(&rel);
        if let Some(target) = symlink {
            record.symlink = target;
        }
    }
    for (rel, target, mode) in symlinks {
        let parent = tree.ensure_dir_mut(rel.parent().unwrap_or(Utf8Path::new("")));
        let name = rel.file_name().unwrap_or_default().to_owned();
        parent.files.insert(
            name.clone(),
            FileRecord {
                name,
                digest: None,
                size: 0,
                mode,
                rewrite: Vec::new(),
                symlink: target,
            },
        );
    }
    let mut lifted = Mutex::into_inner(
        Arc::try_unwrap(lifted).map_err(|_| anyhow::anyhow!("lift tasks still hold results"))?,
    )
    .unwrap();
    lifted.sort_by(|a, b| a.0.cmp(&b.0));
    for (rel, record) in lifted {
        let parent = tree.ensure_dir_mut(rel.parent().unwrap_or(Utf8Path::new("")));
        parent.files.insert(record.name.clone(), record);
    }

    let root = Root {
        path: staged.to_owned(),
        identity: crate::blueprint::hash(blueprint),
        platform: current_platform(),
        blueprint: String::from_utf8_lossy(blueprint).into_owned(),
        controller: controller.to_owned(),
        space: space.to_owned(),
        lifted: Utc::now(),
        rewrite: staged.to_string(),
        tree,
    };
    root.validate()?;
    debug!(
        "Lifted {} files under {staged} as {}",
        root.file_count(),
        root.identity
    );
    Ok(root)
}

#[cfg(unix)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o7777
}

#[cfg(windows)]
fn mode_bits(meta: &fs::Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}
