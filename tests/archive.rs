use std::fs::{self, File};
use std::io::Write;

use anyhow::Result;

use holotree::error::{self, HoloError};

mod common;
use common::*;

#[test]
fn export_import_restores_identically() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);
    let bp1 = stage_bp1(&lib)?;
    let identity = lib.record(&bp1, "ctrl", "sp")?;
    let (source_tree, _) = lib.restore_full(&bp1, "ctrl", "sp", false)?;

    let archive = lib.archive_path(&identity);
    lib.export(&[identity.clone()], &[], &archive)?;
    assert!(archive.is_file());

    // A cold library on the other side of the wire.
    let dir2 = tempfile::tempdir()?;
    let lib2 = fresh_library(&dir2, true);
    assert!(!lib2.has_blueprint(&bp1));
    let imported = lib2.import_archive(&archive)?;
    assert_eq!(imported, vec![identity]);
    assert!(lib2.has_blueprint(&bp1));

    let (restored, _) = lib2.restore_full(&bp1, "ctrl", "sp", false)?;
    for rel in ["bin/x", "lib/y.so"] {
        assert_eq!(
            fs::read(source_tree.join(rel))?,
            fs::read(restored.join(rel))?,
            "{rel} differs after archive round trip"
        );
    }
    // The in-tree symlink came through the catalog.
    #[cfg(unix)]
    assert_eq!(
        fs::read_link(restored.join("lib/link"))?.to_str(),
        Some("y.so")
    );
    Ok(())
}

#[test]
fn delta_export_skips_known_blobs() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);
    let bp1 = stage_bp1(&lib)?;
    let identity = lib.record(&bp1, "ctrl", "sp")?;

    let full = lib.archive_path(&identity);
    lib.export(&[identity.clone()], &[], &full)?;
    let delta = lib.context().archive_dir().join("delta.tar.zst");
    // Receiver already has everything this same catalog references.
    lib.export(&[identity.clone()], &[identity.clone()], &delta)?;

    assert!(fs::metadata(&delta)?.len() < fs::metadata(&full)?.len());
    Ok(())
}

fn evil_archive(path: &camino::Utf8Path, with_marker: bool) -> Result<()> {
    let fh = File::create(path)?;
    let zstd = zstd::stream::write::Encoder::new(fh, 0)?.auto_finish();
    let mut tar = tar::Builder::new(zstd);

    let mut append = |name: &[u8], bytes: &[u8]| -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, bytes)?;
        Ok(())
    };

    if with_marker {
        append(b"RCCARCHIVE", b"RCCARCHIVE/1.0\n")?;
    }
    append(b"../../outside.txt", b"gotcha")?;
    let mut inner = tar.into_inner()?;
    inner.flush()?;
    Ok(())
}

#[test]
fn traversal_entries_are_rejected() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);

    let evil = utf8(dir.path()).join("evil.tar.zst");
    evil_archive(&evil, true)?;

    let err = lib.import_archive(&evil).unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<HoloError>(),
            Some(HoloError::ArchiveInvalid(_))
        ),
        "got {err:#}"
    );
    // Nothing escaped.
    assert!(!dir.path().join("outside.txt").exists());
    assert!(!dir.path().parent().unwrap().join("outside.txt").exists());
    Ok(())
}

#[test]
fn markerless_archives_are_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);
    let evil = utf8(dir.path()).join("markerless.tar.zst");
    evil_archive(&evil, false)?;
    let err = lib.import_archive(&evil).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HoloError>(),
        Some(HoloError::ArchiveInvalid(_))
    ));
    Ok(())
}

#[test]
fn zip_import_round_trips_and_validates() -> Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);
    let bp1 = stage_bp1(&lib)?;
    let identity = lib.record(&bp1, "ctrl", "sp")?;

    // Pack the hololib layout into a zip by hand.
    let zip_path = utf8(dir.path()).join("hololib.zip");
    {
        let fh = File::create(&zip_path)?;
        let mut zip = zip::ZipWriter::new(fh);
        let options: zip::write::FileOptions =
            zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        let hololib = lib.context().hololib();
        for entry in walkdir::WalkDir::new(&hololib).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = utf8(entry.path().strip_prefix(&hololib)?);
            if !(rel.starts_with("catalog") || rel.starts_with("library")) {
                continue;
            }
            zip.start_file(rel.as_str(), options)?;
            zip.write_all(&fs::read(entry.path())?)?;
        }
        zip.finish()?;
    }

    let dir2 = tempfile::tempdir()?;
    let lib2 = fresh_library(&dir2, true);
    let imported = lib2.import_zip(&zip_path)?;
    assert_eq!(imported, vec![identity]);
    let (restored, _) = lib2.restore_full(&bp1, "ctrl", "sp", false)?;
    assert_eq!(fs::read(restored.join("bin/x"))?, vec![0x42u8; 100]);
    Ok(())
}

#[test]
fn zip_traversal_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);

    let zip_path = utf8(dir.path()).join("evil.zip");
    {
        let fh = File::create(&zip_path)?;
        let mut zip = zip::ZipWriter::new(fh);
        let options: zip::write::FileOptions = zip::write::FileOptions::default();
        zip.start_file("../evil.txt", options)?;
        zip.write_all(b"gotcha")?;
        zip.finish()?;
    }

    let err = lib.import_zip(&zip_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<HoloError>(),
        Some(HoloError::ArchiveInvalid(_))
    ));
    assert!(!dir.path().join("evil.txt").exists());
    Ok(())
}

#[test]
fn trim_archives_by_age() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let lib = fresh_library(&dir, true);
    let archives = lib.context().archive_dir();
    fs::create_dir_all(&archives)?;

    let old = archives.join("old.tar.zst");
    let new = archives.join("new.tar.zst");
    fs::write(&old, b"old")?;
    fs::write(&new, b"new")?;

    // Backdate the old one far beyond the cutoff.
    let past = std::time::SystemTime::now() - std::time::Duration::from_secs(90 * 24 * 3600);
    let fh = fs::File::options().write(true).open(&old)?;
    fh.set_times(fs::FileTimes::new().set_modified(past))?;
    drop(fh);

    assert_eq!(lib.trim_archives(30)?, 1);
    assert!(!old.exists());
    assert!(new.exists());

    // And check errors stay typed while we're here.
    let err = lib.restore(b"no such blueprint", "c", "s").unwrap_err();
    assert!(error::is_not_found(&err));
    Ok(())
}
