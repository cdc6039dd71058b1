#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use holotree::context::HolotreeContext;
use holotree::library::Library;

pub fn init_logging() {
    use tracing_subscriber::prelude::*;
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8Path::from_path(path)
        .expect("temp paths should be UTF-8")
        .to_owned()
}

/// A library under a fresh product home.
pub fn fresh_library(dir: &tempfile::TempDir, compress: bool) -> Library {
    let home = utf8(dir.path());
    Library::open(HolotreeContext::new(home).with_compression(compress))
}

/// Walk a tree and collect every path whose name looks like a part file.
pub fn part_files_under(root: &Utf8Path) -> Vec<Utf8PathBuf> {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| holotree::file_util::is_part_file(&e.file_name().to_string_lossy()))
        .map(|e| utf8(e.path()))
        .collect()
}

/// Stage the three-file tree scenario: a 100-byte binary, a 200 KiB shared
/// object with the stage prefix embedded at offset 64, and a symlink.
pub fn stage_bp1(lib: &Library) -> Result<Vec<u8>> {
    let staged = lib.stage()?;
    fs::create_dir_all(staged.join("bin"))?;
    fs::create_dir_all(staged.join("lib"))?;

    fs::write(staged.join("bin/x"), vec![0x42u8; 100])?;

    let mut so = Vec::with_capacity(200 * 1024);
    so.extend_from_slice(&[0u8; 64]);
    so.extend_from_slice(staged.as_str().as_bytes());
    while so.len() < 200 * 1024 {
        so.push((so.len() % 251) as u8);
    }
    fs::write(staged.join("lib/y.so"), &so)?;

    #[cfg(unix)]
    std::os::unix::fs::symlink("y.so", staged.join("lib/link"))?;

    Ok(holotree::blueprint::canonical(
        "dependencies:\n  - python=3.11\n  - pip\n",
    ))
}

pub fn mtime_secs(path: &Utf8Path) -> i64 {
    let meta = fs::metadata(path).expect("stat failed");
    meta.modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}
