//! The catalog's view of an environment: immutable file and directory
//! records created at lift time, persisted as JSON, and walked at restore.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Result, bail, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_derive::{Deserialize, Serialize};

use crate::context::MOTHER_TIME_SECS;
use crate::file_util;
use crate::hashing::Digest;

/// A single file inside a catalog tree.
///
/// Symlinks carry no digest (the `N/A` sentinel on the wire), no size, and
/// no rewrites; everything else carries all three.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileRecord {
    pub name: String,
    #[serde(with = "digest_or_na")]
    pub digest: Option<Digest>,
    pub size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rewrite: Vec<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symlink: String,
}

mod digest_or_na {
    use super::Digest;
    use serde::{Deserialize, Deserializer, Serializer};

    const SENTINEL: &str = "N/A";

    pub fn serialize<S: Serializer>(d: &Option<Digest>, serializer: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_str(&d.to_string()),
            None => serializer.serialize_str(SENTINEL),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Digest>, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == SENTINEL {
            Ok(None)
        } else {
            s.parse().map(Some).map_err(serde::de::Error::custom)
        }
    }
}

impl FileRecord {
    pub fn is_symlink(&self) -> bool {
        !self.symlink.is_empty()
    }

    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }

    /// The fast cleanliness check: a file on disk is taken as unmodified iff
    /// its size matches and its mtime is still pinned to mother time.
    pub fn matches(&self, meta: &fs::Metadata) -> bool {
        meta.len() == self.size && file_util::mtime_secs(meta) == Some(MOTHER_TIME_SECS)
    }

    fn validate(&self, at: &Utf8Path) -> Result<()> {
        if self.is_symlink() {
            ensure!(
                self.digest.is_none() && self.size == 0 && self.rewrite.is_empty(),
                "Symlink {at}/{} carries file content fields",
                self.name
            );
        } else {
            ensure!(
                self.digest.is_some(),
                "File {at}/{} has no digest",
                self.name
            );
            ensure!(
                self.rewrite.windows(2).all(|w| w[0] < w[1]),
                "File {at}/{} has unsorted or duplicate rewrite offsets",
                self.name
            );
        }
        Ok(())
    }
}

/// A directory and everything under it.
///
/// `shadow` directories are bookkeeping only: never created, never recursed
/// into during restore. Directory symlinks store no children.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub shadow: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub symlink: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dirs: BTreeMap<String, DirRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileRecord>,
}

impl DirRecord {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_symlink(&self) -> bool {
        !self.symlink.is_empty()
    }

    fn validate(&self, at: &Utf8Path) -> Result<()> {
        if self.is_symlink() {
            ensure!(
                self.dirs.is_empty() && self.files.is_empty(),
                "Directory symlink {at}/{} stores children",
                self.name
            );
        }
        for (key, file) in &self.files {
            ensure!(
                *key == file.name,
                "File keyed {key} under {at} names itself {}",
                file.name
            );
            file.validate(at)?;
        }
        for (key, dir) in &self.dirs {
            ensure!(
                *key == dir.name,
                "Directory keyed {key} under {at} names itself {}",
                dir.name
            );
            if self.files.contains_key(key) {
                bail!("{at}/{key} is both a file and a directory");
            }
            dir.validate(&at.join(key))?;
        }
        Ok(())
    }

    /// Visit every file record reachable through non-shadow, non-symlink
    /// directories, depth first, in name order.
    pub fn walk<'s>(
        &'s self,
        prefix: &Utf8Path,
        visit: &mut impl FnMut(Utf8PathBuf, &'s FileRecord),
    ) {
        if self.shadow || self.is_symlink() {
            return;
        }
        for (name, file) in &self.files {
            visit(prefix.join(name), file);
        }
        for (name, dir) in &self.dirs {
            dir.walk(&prefix.join(name), visit);
        }
    }
}

/// A persisted catalog: one environment tree plus the metadata needed to
/// restore it anywhere.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Root {
    /// Where the tree was staged when it was lifted.
    pub path: Utf8PathBuf,
    /// The blueprint hash this catalog is keyed by.
    pub identity: String,
    pub platform: String,
    /// Canonical blueprint text, kept for provenance and re-validation.
    pub blueprint: String,
    pub controller: String,
    pub space: String,
    pub lifted: DateTime<Utc>,
    /// The absolute-path prefix captured at lift time. Restores overwrite
    /// it with the running install's prefix; equal lengths are enforced
    /// before any writes.
    pub rewrite: String,
    pub tree: DirRecord,
}

impl Root {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            crate::hashing::plausible_digest(&self.identity),
            "Catalog identity {} is not a blueprint hash",
            self.identity
        );
        self.tree.validate(Utf8Path::new(""))
    }

    /// Every distinct blob digest the tree references, in sorted order.
    pub fn all_digests(&self) -> Vec<Digest> {
        let mut digests = Vec::new();
        self.tree.walk(Utf8Path::new(""), &mut |_path, file| {
            if let Some(d) = file.digest {
                digests.push(d);
            }
        });
        digests.sort();
        digests.dedup();
        digests
    }

    /// Relative path → digest for every regular file in the tree.
    pub fn digest_map(&self) -> FxHashMap<Utf8PathBuf, Digest> {
        let mut map = FxHashMap::default();
        self.tree.walk(Utf8Path::new(""), &mut |path, file| {
            if let Some(d) = file.digest {
                map.insert(path, d);
            }
        });
        map
    }

    pub fn file_count(&self) -> usize {
        let mut n = 0;
        self.tree.walk(Utf8Path::new(""), &mut |_, _| n += 1);
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_file(name: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            name: name.into(),
            digest: Some(Digest::hash(false, content)),
            size: content.len() as u64,
            mode: 0o644,
            rewrite: Vec::new(),
            symlink: String::new(),
        }
    }

    fn sample_root() -> Root {
        let mut tree = DirRecord::named("");
        tree.files
            .insert("a.txt".into(), sample_file("a.txt", b"aaa"));
        let mut sub = DirRecord::named("lib");
        sub.files.insert("b.so".into(), sample_file("b.so", b"bbb"));
        sub.files.insert(
            "link".into(),
            FileRecord {
                name: "link".into(),
                digest: None,
                size: 0,
                mode: 0o777,
                rewrite: Vec::new(),
                symlink: "b.so".into(),
            },
        );
        tree.dirs.insert("lib".into(), sub);

        Root {
            path: "/opt/robo/hololib/stage".into(),
            identity: Digest::hash(false, b"blueprint").to_string(),
            platform: "linux_x86_64".into(),
            blueprint: "channels:\n- conda-forge\n".into(),
            controller: "ctrl".into(),
            space: "sp".into(),
            lifted: crate::context::mother_time(),
            rewrite: "/opt/robo/hololib/stage".into(),
            tree,
        }
    }

    #[test]
    fn validates() {
        sample_root().validate().unwrap();
    }

    #[test]
    fn symlink_with_content_fields_rejected() {
        let mut root = sample_root();
        let lib = root.tree.dirs.get_mut("lib").unwrap();
        lib.files.get_mut("link").unwrap().size = 3;
        assert!(root.validate().is_err());
    }

    #[test]
    fn unsorted_rewrites_rejected() {
        let mut root = sample_root();
        root.tree.files.get_mut("a.txt").unwrap().rewrite = vec![9, 3];
        assert!(root.validate().is_err());
    }

    #[test]
    fn digests_are_deduplicated() {
        let mut root = sample_root();
        root.tree
            .files
            .insert("a2.txt".into(), sample_file("a2.txt", b"aaa"));
        // a.txt and a2.txt share content; link has none.
        assert_eq!(root.all_digests().len(), 2);
        assert_eq!(root.file_count(), 4);
    }

    #[test]
    fn shadow_dirs_hidden_from_walks() {
        let mut root = sample_root();
        root.tree.dirs.get_mut("lib").unwrap().shadow = true;
        let paths: Vec<_> = {
            let mut v = Vec::new();
            root.tree
                .walk(Utf8Path::new(""), &mut |p, _| v.push(p.to_string()));
            v
        };
        assert_eq!(paths, vec!["a.txt"]);
    }

    #[test]
    fn json_round_trip() -> Result<()> {
        let root = sample_root();
        let json = serde_json::to_string_pretty(&root)?;
        // Wire schema uses PascalCase keys and the N/A digest sentinel.
        assert!(json.contains("\"Tree\""));
        assert!(json.contains("\"Digest\""));
        assert!(json.contains("\"N/A\""));
        let back: Root = serde_json::from_str(&json)?;
        assert_eq!(root, back);
        Ok(())
    }
}
