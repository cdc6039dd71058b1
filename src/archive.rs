//! The archive interchange format: a zstd-compressed tar carrying a version
//! marker, the stored-form blobs a catalog references, and a trailing
//! manifest. Also the (stricter) import path for plain hololib zips.
//!
//! Nothing from an archive touches the filesystem until its name survives
//! validation; traversal attempts die before any file is opened.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use rustc_hash::FxHashSet;
use serde_derive::{Deserialize, Serialize};
use tracing::*;

use crate::blobs::{BlobStore, BlobStoreMut};
use crate::catalog;
use crate::error::HoloError;
use crate::file_util;
use crate::hashing::{Digest, plausible_digest};
use crate::tree::Root;

const MARKER_NAME: &str = "RCCARCHIVE";
const MANIFEST_NAME: &str = "manifest.json";
const VERSION_MAJOR: u32 = 1;
const VERSION_MINOR: u32 = 0;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: String,
    files: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    digest: String,
    size: u64,
    mode: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    rewrite: Vec<u64>,
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    HoloError::ArchiveInvalid(msg.into()).into()
}

/// Join `name` under `dest`, refusing anything that would land outside:
/// absolute names, `..` components, and sibling-prefix escapes
/// (`/tmp/dest` vs `/tmp/destevil`) all die here.
pub fn safe_join(dest: &Utf8Path, name: &str) -> Result<Utf8PathBuf> {
    let rel = Utf8Path::new(name);
    if name.is_empty() || rel.is_absolute() {
        return Err(invalid(format!("unsafe entry name {name:?}")));
    }
    for component in rel.components() {
        match component {
            camino::Utf8Component::Normal(_) => {}
            _ => return Err(invalid(format!("unsafe entry name {name:?}"))),
        }
    }
    let joined = dest.join(rel);
    if !joined.starts_with(dest) {
        return Err(invalid(format!("entry {name:?} escapes {dest}")));
    }
    Ok(joined)
}

/// Lexically resolve a symlink target against the link's directory and
/// check it stays under `dest`. Absolute targets must already be inside.
pub fn symlink_stays_within(dest: &Utf8Path, link_dir: &Utf8Path, target: &str) -> bool {
    let target = Utf8Path::new(target);
    let base: Utf8PathBuf = if target.is_absolute() {
        target.to_owned()
    } else {
        link_dir.join(target)
    };

    let mut stack: Vec<camino::Utf8Component> = Vec::new();
    for component in base.components() {
        match component {
            camino::Utf8Component::CurDir => {}
            camino::Utf8Component::ParentDir => {
                if stack.pop().is_none() {
                    return false;
                }
            }
            other => stack.push(other),
        }
    }
    let mut resolved = Utf8PathBuf::new();
    for c in stack {
        resolved.push(c.as_str());
    }
    resolved.starts_with(dest)
}

/// Write `roots` and the blobs they reference into a zstd-compressed tar at
/// `archive_path`. Digests in `known` are assumed present at the receiving
/// end and shipped as manifest entries only.
pub fn export(
    store: &dyn BlobStore,
    roots: &[&Root],
    known: &FxHashSet<Digest>,
    archive_path: &Utf8Path,
) -> Result<()> {
    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;
    }
    let part = file_util::part_name(archive_path);
    let result = write_archive(store, roots, known, &part);
    if let Err(e) = result.and_then(|()| file_util::commit(&part, archive_path)) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    info!("Exported {} catalog(s) to {archive_path}", roots.len());
    Ok(())
}

fn write_archive(
    store: &dyn BlobStore,
    roots: &[&Root],
    known: &FxHashSet<Digest>,
    part: &Utf8Path,
) -> Result<()> {
    let fh = File::create(part).with_context(|| format!("Couldn't create {part}"))?;
    let zstd = zstd::stream::write::Encoder::new(fh, 0)?.auto_finish();
    let mut tar = tar::Builder::new(zstd);

    let marker = format!("{MARKER_NAME}/{VERSION_MAJOR}.{VERSION_MINOR}\n");
    append_bytes(&mut tar, MARKER_NAME, marker.as_bytes())?;

    let mut digests: Vec<Digest> = Vec::new();
    let mut manifest = Manifest {
        version: format!("{VERSION_MAJOR}.{VERSION_MINOR}"),
        files: BTreeMap::new(),
    };
    for root in roots {
        let json = serde_json::to_vec_pretty(root)?;
        append_bytes(&mut tar, &format!("catalog/{}", root.identity), &json)?;
        digests.extend(root.all_digests());

        root.tree.walk(Utf8Path::new(""), &mut |rel, file| {
            if let Some(d) = file.digest {
                manifest.files.insert(
                    rel.to_string(),
                    ManifestEntry {
                        digest: d.to_string(),
                        size: file.size,
                        mode: file.mode,
                        rewrite: file.rewrite.clone(),
                    },
                );
            }
        });
    }
    digests.sort();
    digests.dedup();

    for digest in &digests {
        if known.contains(digest) {
            continue;
        }
        let mut blob = store.open_stored(digest)?;
        let size = blob
            .metadata()
            .with_context(|| format!("Couldn't stat blob {digest}"))?
            .len();
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, format!("files/{digest}"), &mut blob)
            .with_context(|| format!("Couldn't archive blob {digest}"))?;
    }

    append_bytes(&mut tar, MANIFEST_NAME, &serde_json::to_vec_pretty(&manifest)?)?;
    tar.into_inner()?.flush()?;
    Ok(())
}

fn append_bytes<W: Write>(tar: &mut tar::Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tar.append_data(&mut header, name, bytes)
        .with_context(|| format!("Couldn't archive {name}"))
}

/// Import an archive produced by [`export`]: blobs land at their canonical
/// library locations (existing ones are skipped), catalogs are validated
/// and persisted under `catalog_dir`. Returns the imported blueprint
/// hashes.
pub fn import(
    store: &dyn BlobStoreMut,
    catalog_dir: &Utf8Path,
    archive_path: &Utf8Path,
) -> Result<Vec<String>> {
    let fh = File::open(archive_path).with_context(|| format!("Couldn't open {archive_path}"))?;
    let zstd = zstd::stream::read::Decoder::new(fh)
        .context("Decompression of archive stream failed")?;
    let mut tar = tar::Archive::new(zstd);

    let mut saw_marker = false;
    let mut manifest: Option<Manifest> = None;
    let mut imported = Vec::new();

    for entry in tar
        .entries()
        .with_context(|| format!("Couldn't read {archive_path}"))?
    {
        let mut entry = entry.with_context(|| format!("Couldn't read {archive_path}"))?;
        let name = {
            let path = entry.path().context("Archive entry has an unreadable name")?;
            path.to_str()
                .ok_or_else(|| invalid("non-UTF-8 entry name"))?
                .to_owned()
        };
        if entry.header().entry_type() != tar::EntryType::Regular {
            return Err(invalid(format!("non-regular entry {name:?}")));
        }

        if !saw_marker {
            // The version marker leads so incompatibilities die before any
            // extraction work happens.
            if name != MARKER_NAME {
                return Err(invalid("archive has no version marker"));
            }
            let mut body = String::new();
            entry.read_to_string(&mut body)?;
            check_version(body.trim())?;
            saw_marker = true;
            continue;
        }

        if let Some(hash) = name.strip_prefix("catalog/") {
            if !plausible_digest(hash) {
                return Err(invalid(format!("bad catalog name {name:?}")));
            }
            let root: Root =
                serde_json::from_reader(&mut entry).context("Couldn't parse archived catalog")?;
            root.validate()?;
            if root.identity != hash {
                return Err(invalid(format!("catalog {hash} says it is {}", root.identity)));
            }
            let dest = safe_join(catalog_dir, hash)?;
            catalog::save_as(&root, &dest)?;
            imported.push(root.identity);
        } else if let Some(hex) = name.strip_prefix("files/") {
            if !plausible_digest(hex) {
                return Err(invalid(format!("bad blob name {name:?}")));
            }
            let digest: Digest = hex.parse()?;
            store.adopt_stored(&digest, &mut entry)?;
        } else if name == MANIFEST_NAME {
            let parsed: Manifest =
                serde_json::from_reader(&mut entry).context("Couldn't parse manifest")?;
            check_version(&format!("{MARKER_NAME}/{}", parsed.version))?;
            manifest = Some(parsed);
        } else {
            return Err(invalid(format!("unexpected entry {name:?}")));
        }
    }

    if !saw_marker {
        return Err(invalid("archive has no version marker"));
    }
    let manifest = manifest.ok_or_else(|| invalid("archive has no manifest"))?;
    debug!(
        "Imported {} catalog(s), manifest covers {} files",
        imported.len(),
        manifest.files.len()
    );
    Ok(imported)
}

fn check_version(marker: &str) -> Result<()> {
    let version = marker
        .strip_prefix(&format!("{MARKER_NAME}/"))
        .ok_or_else(|| invalid(format!("bad version marker {marker:?}")))?;
    let (major, _minor) = version
        .split_once('.')
        .ok_or_else(|| invalid(format!("bad version {version:?}")))?;
    let major: u32 = major
        .parse()
        .map_err(|_| invalid(format!("bad version {version:?}")))?;
    if major != VERSION_MAJOR {
        return Err(invalid(format!(
            "archive major version {major} != supported {VERSION_MAJOR}"
        )));
    }
    Ok(())
}

/// Import a plain hololib zip: `catalog/<hash>` and
/// `library/<aa>/<bb>/<cc>/<digest>` entries, same safety rules as tar.
pub fn import_zip(
    store: &dyn BlobStoreMut,
    hololib_root: &Utf8Path,
    zip_path: &Utf8Path,
) -> Result<Vec<String>> {
    let fh = File::open(zip_path).with_context(|| format!("Couldn't open {zip_path}"))?;
    let mut zip = zip::ZipArchive::new(fh).with_context(|| format!("Couldn't read {zip_path}"))?;

    let mut imported = Vec::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_owned();
        if name.ends_with('/') {
            continue; // Directories materialize as needed.
        }
        // Every name must land inside the library before we look closer.
        let joined = safe_join(hololib_root, &name)?;

        // Symlinks never belong in a hololib zip; check containment first
        // so a hostile one reports as the escape it is.
        if entry.unix_mode().is_some_and(|m| m & 0o170000 == 0o120000) {
            let mut target = String::new();
            entry.read_to_string(&mut target)?;
            let link_dir = joined.parent().unwrap_or(hololib_root);
            if !symlink_stays_within(hololib_root, link_dir, &target) {
                return Err(invalid(format!("symlink {name:?} escapes the library")));
            }
            return Err(invalid(format!("symlink entry {name:?} in zip")));
        }

        if let Some(hash) = name.strip_prefix("catalog/") {
            if !plausible_digest(hash) {
                return Err(invalid(format!("bad catalog name {name:?}")));
            }
            let root: Root =
                serde_json::from_reader(&mut entry).context("Couldn't parse zipped catalog")?;
            root.validate()?;
            if root.identity != hash {
                return Err(invalid(format!("catalog {hash} says it is {}", root.identity)));
            }
            catalog::save_as(&root, &joined)?;
            imported.push(root.identity);
        } else if let Some(rest) = name.strip_prefix("library/") {
            let digest_name = Utf8Path::new(rest)
                .file_name()
                .ok_or_else(|| invalid(format!("bad library entry {name:?}")))?;
            if !plausible_digest(digest_name) {
                return Err(invalid(format!("bad blob name {name:?}")));
            }
            let digest: Digest = digest_name.parse()?;
            // The shard prefix must match the digest; anything else is a
            // relocation attempt.
            let (aa, bb, cc) = digest.shards();
            if rest != format!("{aa}/{bb}/{cc}/{digest_name}") {
                return Err(invalid(format!("blob {name:?} at the wrong shard")));
            }
            store.adopt_stored(&digest, &mut entry)?;
        } else {
            return Err(invalid(format!("unexpected entry {name:?}")));
        }
    }
    Ok(imported)
}

/// Age-based trimming of exported archives.
pub fn trim_archives(archive_dir: &Utf8Path, max_age_days: u64) -> Result<usize> {
    let entries = match fs::read_dir(archive_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("Couldn't list {archive_dir}"))),
    };
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(max_age_days * 24 * 60 * 60);

    let mut trimmed = 0;
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        if meta.modified()? < cutoff {
            let path = file_util::utf8(&entry.path())?.to_owned();
            debug!("Trimming old archive {path}");
            file_util::try_remove(&path)?;
            trimmed += 1;
        }
    }
    Ok(trimmed)
}
